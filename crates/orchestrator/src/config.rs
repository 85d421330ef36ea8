//! Configuration parsing and validation for snow-crystal simulations

use serde::{Deserialize, Serialize};
use std::fs;

use compute::SpecializationConstants;

/// Voxel layers between the crystal's growth region and the grid edge.
pub const BOUNDARY_THICKNESS: i32 = 1;

/// Number of frozen-neighbour configurations with their own coefficients.
pub const NEIGHBOUR_CONFIGURATIONS: usize = 7;

/// Neighbour configuration names, in coefficient order: the first digit is
/// the number of frozen in-plane neighbours (capped at 3), the second whether
/// a vertical neighbour is frozen.
pub const CONFIGURATION_NAMES: [&str; NEIGHBOUR_CONFIGURATIONS] = ["01", "10", "11", "20", "21", "30", "31"];

/// One coefficient per neighbour configuration.
///
/// In JSON either a single number (applied to every configuration) or an
/// object keyed by configuration name, e.g. `{"01": 2.5, "10": 2.0, ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "CoefficientsRepr", into = "CoefficientsRepr")]
pub struct Coefficients([f64; NEIGHBOUR_CONFIGURATIONS]);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CoefficientsRepr {
    Uniform(f64),
    PerNeighbour {
        #[serde(rename = "01")]
        n01: f64,
        #[serde(rename = "10")]
        n10: f64,
        #[serde(rename = "11")]
        n11: f64,
        #[serde(rename = "20")]
        n20: f64,
        #[serde(rename = "21")]
        n21: f64,
        #[serde(rename = "30")]
        n30: f64,
        #[serde(rename = "31")]
        n31: f64,
    },
}

impl From<CoefficientsRepr> for Coefficients {
    fn from(repr: CoefficientsRepr) -> Self {
        match repr {
            CoefficientsRepr::Uniform(v) => Coefficients::uniform(v),
            CoefficientsRepr::PerNeighbour { n01, n10, n11, n20, n21, n30, n31 } => {
                Coefficients([n01, n10, n11, n20, n21, n30, n31])
            }
        }
    }
}

impl From<Coefficients> for CoefficientsRepr {
    fn from(c: Coefficients) -> Self {
        let [n01, n10, n11, n20, n21, n30, n31] = c.0;
        CoefficientsRepr::PerNeighbour { n01, n10, n11, n20, n21, n30, n31 }
    }
}

impl Coefficients {
    /// The same value for every configuration.
    pub const fn uniform(value: f64) -> Self {
        Self([value; NEIGHBOUR_CONFIGURATIONS])
    }

    /// Explicit values in [`CONFIGURATION_NAMES`] order.
    pub const fn new(values: [f64; NEIGHBOUR_CONFIGURATIONS]) -> Self {
        Self(values)
    }

    /// Values in [`CONFIGURATION_NAMES`] order.
    pub fn values(&self) -> &[f64; NEIGHBOUR_CONFIGURATIONS] {
        &self.0
    }

    /// Mean over all configurations.
    pub fn average(&self) -> f64 {
        self.0.iter().sum::<f64>() / NEIGHBOUR_CONFIGURATIONS as f64
    }
}

/// Physical coefficients of the medium the crystal grows in.
///
/// - `rho`: ambient vapour density (the Dirichlet value of the diffusive field)
/// - `phi`: noise amplitude applied to the diffusive field
/// - `kappa`: fraction of diffusive mass kept when a boundary voxel freezes
/// - `mu`: melt rate of boundary mass back into vapour
/// - `beta`: attachment threshold of boundary mass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Medium {
    /// Ambient vapour density
    #[serde(default = "default_rho")]
    pub rho: f64,
    /// Noise amplitude
    #[serde(default)]
    pub phi: f64,
    /// Freezing coefficients
    #[serde(default = "default_kappa")]
    pub kappa: Coefficients,
    /// Melt rates
    #[serde(default = "default_mu")]
    pub mu: Coefficients,
    /// Attachment thresholds
    #[serde(default = "default_beta")]
    pub beta: Coefficients,
}

// Default values
fn default_rho() -> f64 {
    0.1
}

fn default_kappa() -> Coefficients {
    Coefficients::uniform(0.005)
}

fn default_mu() -> Coefficients {
    Coefficients::uniform(0.001)
}

fn default_beta() -> Coefficients {
    Coefficients::new([1.6, 1.5, 1.4, 1.3, 1.2, 1.1, 1.0])
}

fn default_voxel_count() -> u32 {
    64
}

fn default_headless() -> bool {
    true
}

fn default_log_interval() -> u64 {
    100
}

impl Default for Medium {
    fn default() -> Self {
        Self {
            rho: default_rho(),
            phi: 0.0,
            kappa: default_kappa(),
            mu: default_mu(),
            beta: default_beta(),
        }
    }
}

macro_rules! neighbour_accessors {
    ($field:ident: $($get:ident, $set:ident => $idx:expr;)*) => {
        $(
            #[doc = concat!("`", stringify!($field), "` for configuration ", stringify!($get), ".")]
            pub fn $get(&self) -> f64 {
                self.$field.0[$idx]
            }

            #[doc = concat!("Set [`", stringify!($get), "`](Self::", stringify!($get), ").")]
            pub fn $set(&mut self, value: f64) {
                self.$field.0[$idx] = value;
            }
        )*
    };
}

impl Medium {
    /// Ambient vapour density.
    pub fn rho(&self) -> f64 {
        self.rho
    }

    /// Noise amplitude.
    pub fn phi(&self) -> f64 {
        self.phi
    }

    /// Set the ambient vapour density.
    pub fn set_rho(&mut self, rho: f64) {
        self.rho = rho;
    }

    /// Set the noise amplitude.
    pub fn set_phi(&mut self, phi: f64) {
        self.phi = phi;
    }

    /// Mean freezing coefficient.
    pub fn kappa(&self) -> f64 {
        self.kappa.average()
    }

    /// Mean melt rate.
    pub fn mu(&self) -> f64 {
        self.mu.average()
    }

    /// Mean attachment threshold, averaged over the seven beta coefficients.
    /// Melt rates do not enter it, so changing `mu` leaves this value as is.
    pub fn beta(&self) -> f64 {
        self.beta.average()
    }

    /// Set every freezing coefficient.
    pub fn set_kappa(&mut self, kappa: f64) {
        self.kappa = Coefficients::uniform(kappa);
    }

    /// Set every melt rate.
    pub fn set_mu(&mut self, mu: f64) {
        self.mu = Coefficients::uniform(mu);
    }

    /// Set every attachment threshold.
    pub fn set_beta(&mut self, beta: f64) {
        self.beta = Coefficients::uniform(beta);
    }

    neighbour_accessors! { kappa:
        kappa_01, set_kappa_01 => 0;
        kappa_10, set_kappa_10 => 1;
        kappa_11, set_kappa_11 => 2;
        kappa_20, set_kappa_20 => 3;
        kappa_21, set_kappa_21 => 4;
        kappa_30, set_kappa_30 => 5;
        kappa_31, set_kappa_31 => 6;
    }

    neighbour_accessors! { mu:
        mu_01, set_mu_01 => 0;
        mu_10, set_mu_10 => 1;
        mu_11, set_mu_11 => 2;
        mu_20, set_mu_20 => 3;
        mu_21, set_mu_21 => 4;
        mu_30, set_mu_30 => 5;
        mu_31, set_mu_31 => 6;
    }

    neighbour_accessors! { beta:
        beta_01, set_beta_01 => 0;
        beta_10, set_beta_10 => 1;
        beta_11, set_beta_11 => 2;
        beta_20, set_beta_20 => 3;
        beta_21, set_beta_21 => 4;
        beta_30, set_beta_30 => 5;
        beta_31, set_beta_31 => 6;
    }

    /// Validate the coefficients
    pub fn validate(&self) -> Result<(), String> {
        if !(self.rho > 0.0) {
            return Err("rho must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.phi) {
            return Err("phi must be in range [0, 1]".to_string());
        }
        for (name, coefficients) in [("kappa", &self.kappa), ("mu", &self.mu)] {
            for (config, &v) in CONFIGURATION_NAMES.iter().zip(coefficients.values()) {
                if !(0.0..=1.0).contains(&v) {
                    return Err(format!("{name}_{config} must be in range [0, 1], got {v}"));
                }
            }
        }
        for (config, &v) in CONFIGURATION_NAMES.iter().zip(self.beta.values()) {
            if !(v > 0.0) {
                return Err(format!("beta_{config} must be positive, got {v}"));
            }
        }
        Ok(())
    }
}

/// Hexagonal prism the crystal grows from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedCrystal {
    /// In-plane hexagonal radius (voxels)
    #[serde(default = "default_seed_radius")]
    pub radius: i32,
    /// Vertical thickness (voxels)
    #[serde(default = "default_seed_thickness")]
    pub thickness: i32,
}

fn default_seed_radius() -> i32 {
    2
}

fn default_seed_thickness() -> i32 {
    1
}

impl Default for SeedCrystal {
    fn default() -> Self {
        Self {
            radius: default_seed_radius(),
            thickness: default_seed_thickness(),
        }
    }
}

/// Grid size, medium and seed of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParameters {
    /// Voxels along x
    #[serde(default = "default_voxel_count")]
    pub voxel_x: u32,
    /// Voxels along y
    #[serde(default = "default_voxel_count")]
    pub voxel_y: u32,
    /// Voxels along z
    #[serde(default = "default_voxel_count")]
    pub voxel_z: u32,
    /// Medium coefficients
    #[serde(default)]
    pub medium: Medium,
    /// Seed crystal
    #[serde(default)]
    pub seed: SeedCrystal,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            voxel_x: default_voxel_count(),
            voxel_y: default_voxel_count(),
            voxel_z: default_voxel_count(),
            medium: Medium::default(),
            seed: SeedCrystal::default(),
        }
    }
}

impl SimulationParameters {
    /// Parameters for an `x * y * z` grid with default medium and seed.
    pub fn with_grid(x: u32, y: u32, z: u32) -> Self {
        Self {
            voxel_x: x,
            voxel_y: y,
            voxel_z: z,
            ..Self::default()
        }
    }

    /// Grid extent `[x, y, z]`.
    pub fn extent(&self) -> [u32; 3] {
        [self.voxel_x, self.voxel_y, self.voxel_z]
    }

    /// Voxels in one field.
    pub fn voxel_count(&self) -> usize {
        self.voxel_x as usize * self.voxel_y as usize * self.voxel_z as usize
    }

    /// In-plane radius of the growth region.
    pub fn radius_t(&self) -> i32 {
        (self.voxel_x.min(self.voxel_y) as i32 / 2) - (1 + BOUNDARY_THICKNESS)
    }

    /// Vertical half-height of the growth region.
    pub fn radius_z(&self) -> i32 {
        (self.voxel_z as i32 / 2) - (1 + BOUNDARY_THICKNESS)
    }

    /// Kernel constants, `@id(0)` through `@id(27)`: grid extent, radii,
    /// rho, phi, then kappa, mu and beta per neighbour configuration.
    pub fn specialization_constants(&self) -> SpecializationConstants {
        let m = &self.medium;
        let mut constants = SpecializationConstants::new()
            .with(self.voxel_x as f32)
            .with(self.voxel_y as f32)
            .with(self.voxel_z as f32)
            .with(self.radius_t() as f32)
            .with(self.radius_z() as f32)
            .with(m.rho as f32)
            .with(m.phi as f32);
        for coefficients in [&m.kappa, &m.mu, &m.beta] {
            for &v in coefficients.values() {
                constants.push(v as f32);
            }
        }
        constants
    }

    /// Validate the grid, medium and seed
    pub fn validate(&self) -> Result<(), String> {
        for (axis, n) in [("x", self.voxel_x), ("y", self.voxel_y), ("z", self.voxel_z)] {
            if n < 4 {
                return Err(format!("voxel_{axis} must be at least 4, got {n}"));
            }
        }
        if self.radius_t() < 1 || self.radius_z() < 1 {
            return Err(format!(
                "grid {}x{}x{} leaves no growth region (radius_t = {}, radius_z = {})",
                self.voxel_x,
                self.voxel_y,
                self.voxel_z,
                self.radius_t(),
                self.radius_z()
            ));
        }

        self.medium.validate()?;

        let seed = &self.seed;
        if seed.radius < 0 || seed.thickness < 1 {
            return Err("Seed radius must be non-negative and thickness at least 1".to_string());
        }
        if seed.radius >= self.radius_t() {
            return Err(format!(
                "Seed radius {} must be less than radius_t {}",
                seed.radius,
                self.radius_t()
            ));
        }
        if seed.thickness - seed.thickness / 2 > self.radius_z() || seed.thickness / 2 > self.radius_z() {
            return Err(format!(
                "Seed thickness {} does not fit within radius_z {}",
                seed.thickness,
                self.radius_z()
            ));
        }
        Ok(())
    }
}

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// Grid, medium and seed
    #[serde(default)]
    pub parameters: SimulationParameters,
    /// Stop after this many timesteps
    pub max_timesteps: Option<u64>,
    /// Skip the render-sample pass
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Timesteps between progress log lines
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;
        Self::from_json_str(&contents)
    }

    /// Parse and validate configuration JSON
    pub fn from_json_str(contents: &str) -> Result<Self, String> {
        let config: SimulationConfig = serde_json::from_str(contents)
            .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.parameters.validate()?;

        // Check max_timesteps
        if let Some(max_timesteps) = self.max_timesteps {
            if max_timesteps == 0 {
                return Err("max_timesteps must be at least 1".to_string());
            }
        }

        if self.log_interval == 0 {
            return Err("log_interval must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radii() {
        let params = SimulationParameters::with_grid(10, 10, 10);
        assert_eq!(params.radius_t(), 3);
        assert_eq!(params.radius_z(), 3);

        let params = SimulationParameters::with_grid(320, 300, 256);
        assert_eq!(params.radius_t(), 148);
        assert_eq!(params.radius_z(), 126);
    }

    #[test]
    fn test_specialization_constant_order() {
        let mut params = SimulationParameters::with_grid(16, 12, 8);
        params.medium.set_rho(0.2);
        params.medium.set_kappa_11(0.3);
        params.medium.set_mu_30(0.04);
        params.medium.set_beta_31(0.9);

        let spec = params.specialization_constants();
        assert_eq!(spec.len(), 28);
        let value = |n: usize| spec.get(n).map(|c| c.as_f64() as f32);
        assert_eq!(value(0), Some(16.0));
        assert_eq!(value(1), Some(12.0));
        assert_eq!(value(2), Some(8.0));
        assert_eq!(value(3), Some(params.radius_t() as f32));
        assert_eq!(value(4), Some(params.radius_z() as f32));
        assert_eq!(value(5), Some(0.2));
        assert_eq!(value(9), Some(0.3));
        assert_eq!(value(19), Some(0.04));
        assert_eq!(value(27), Some(0.9));
    }

    #[test]
    fn test_medium_averages() {
        let mut medium = Medium::default();
        medium.set_kappa(0.1);
        medium.set_mu_01(0.008);
        assert!((medium.kappa() - 0.1).abs() < 1e-12);
        assert!((medium.mu() - (0.008 + 6.0 * 0.001) / 7.0).abs() < 1e-12);
        assert!((medium.beta() - (1.6 + 1.5 + 1.4 + 1.3 + 1.2 + 1.1 + 1.0) / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_beta_average_ignores_melt_rates() {
        let mut medium = Medium::default();
        let before = medium.beta();
        medium.set_mu(0.5);
        medium.set_mu_01(9.0);
        assert_eq!(medium.beta(), before);

        medium.set_beta(2.0);
        medium.set_beta_01(9.0);
        assert!((medium.beta() - (9.0 + 6.0 * 2.0) / 7.0).abs() < 1e-12);
        assert!((medium.mu() - (9.0 + 6.0 * 0.5) / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_coefficients_uniform_or_per_neighbour() {
        let json = r#"{
            "rho": 0.14,
            "kappa": 0.1,
            "beta": {"01": 3.0, "10": 1.4, "11": 1.4, "20": 1.4, "21": 1.0, "30": 1.0, "31": 1.0}
        }"#;
        let medium: Medium = serde_json::from_str(json).unwrap();
        assert_eq!(medium.rho(), 0.14);
        assert_eq!(medium.kappa_31(), 0.1);
        assert_eq!(medium.beta_01(), 3.0);
        assert_eq!(medium.beta_21(), 1.0);
        assert_eq!(medium.mu, default_mu());
        assert_eq!(medium.phi(), 0.0);

        // Serialized form is always per-neighbour and reads back unchanged.
        let back: Medium = serde_json::from_str(&serde_json::to_string(&medium).unwrap()).unwrap();
        assert_eq!(back, medium);
    }

    #[test]
    fn test_validation_grid() {
        let mut params = SimulationParameters::with_grid(3, 10, 10);
        assert!(params.validate().is_err());

        params.voxel_x = 10;
        assert!(params.validate().is_ok());

        // 4x4 leaves radius 0
        let params = SimulationParameters::with_grid(4, 4, 4);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_validation_seed_fits() {
        let mut params = SimulationParameters::with_grid(10, 10, 10);
        params.seed.radius = 3;
        assert!(params.validate().is_err());

        params.seed.radius = 2;
        params.seed.thickness = 7;
        assert!(params.validate().is_err());

        params.seed.thickness = 6;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validation_medium() {
        let mut params = SimulationParameters::with_grid(10, 10, 10);
        params.medium.set_rho(0.0);
        assert!(params.validate().is_err());

        params.medium.set_rho(0.1);
        params.medium.set_kappa_20(1.5);
        assert!(params.validate().is_err());

        params.medium.set_kappa(0.1);
        params.medium.set_beta_10(0.0);
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config = SimulationConfig::from_json_str(
            r#"{"name": "small", "parameters": {"voxel_x": 10, "voxel_y": 10, "voxel_z": 10}, "max_timesteps": 50}"#,
        )
        .unwrap();
        assert_eq!(config.name, "small");
        assert!(config.headless);
        assert_eq!(config.log_interval, 100);
        assert_eq!(config.parameters.seed, SeedCrystal { radius: 2, thickness: 1 });
        assert_eq!(config.parameters.medium, Medium::default());
    }

    #[test]
    fn test_validation_max_timesteps() {
        let result = SimulationConfig::from_json_str(r#"{"name": "zero", "max_timesteps": 0}"#);
        assert!(result.is_err());

        let config = SimulationConfig::from_json_str(r#"{"name": "default grid"}"#).unwrap();
        assert_eq!(config.parameters.extent(), [64, 64, 64]);
        assert_eq!(config.max_timesteps, None);
    }

    #[test]
    fn test_shipped_configs_are_valid() {
        let small = SimulationConfig::from_json_str(include_str!("../../../configs/snowflake-small.json")).unwrap();
        assert_eq!(small.parameters.extent(), [32, 32, 16]);
        assert_eq!(small.parameters.medium, Medium::default());

        let default = SimulationConfig::from_json_str(include_str!("../../../configs/snowflake-default.json")).unwrap();
        assert_eq!(default.parameters, SimulationParameters::default());
    }
}
