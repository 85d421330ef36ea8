//! Schema dependency chain on a real device.
//!
//! Three schemas each add a specialization constant to every element of a
//! tensor and write the result into the next one. Waiting on the last schema
//! alone must observe the effect of all three, proving the earlier ones ran
//! first. Tests return early when no GPU adapter is available.

#![cfg(feature = "gpu")]

use std::sync::Arc;

use compute::gpu::{gpu_available, Context, ContextOptions, ProgramDescriptor, SchemaError, Step, TensorBinding, Work};
use compute::SpecializationConstants;

const ADD_WGSL: &str = r#"
@id(0) override increment: f32 = 1.0;
@id(1) override element_count: u32 = 1u;

@group(0) @binding(0) var<storage, read_write> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= element_count) {
        return;
    }
    dst[id.x] = src[id.x] + increment;
}
"#;

const SPIN_WGSL: &str = r#"
@id(0) override rounds: u32 = 1u;

@group(0) @binding(0) var<storage, read_write> src: array<f32>;
@group(0) @binding(1) var<storage, read_write> dst: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x >= arrayLength(&dst)) {
        return;
    }
    var x = src[id.x];
    for (var k = 0u; k < rounds; k = k + 1u) {
        x = fract(x * 1.0001 + 0.5);
    }
    dst[id.x] = x;
}
"#;

const N: usize = 1000;

fn context() -> Option<Context> {
    if !gpu_available() {
        eprintln!("Skipping: no GPU adapter available");
        return None;
    }
    Some(Context::new(&ContextOptions::default()).expect("context"))
}

#[test]
fn test_chain_waiting_on_last_observes_all() {
    let Some(ctx) = context() else { return };

    let bytes = (N * 4) as u64;
    ctx.dryrun_shared_tensor(bytes).unwrap();
    ctx.dryrun_storage_tensor(bytes).unwrap();
    ctx.dryrun_storage_tensor(bytes).unwrap();
    ctx.dryrun_shared_tensor(bytes).unwrap();
    ctx.allocate_pools().unwrap();

    let input = ctx.shared_tensor::<f32>("input", N).unwrap();
    let mid_a = ctx.storage_tensor::<f32>("mid_a", N).unwrap();
    let mid_b = ctx.storage_tensor::<f32>("mid_b", N).unwrap();
    let output = ctx.shared_tensor::<f32>("output", N).unwrap();

    for (i, v) in input.data_mut().iter_mut().enumerate() {
        *v = i as f32;
    }

    let input_b: Arc<dyn TensorBinding> = input.clone();
    let mid_a_b: Arc<dyn TensorBinding> = mid_a;
    let mid_b_b: Arc<dyn TensorBinding> = mid_b;
    let output_b: Arc<dyn TensorBinding> = output.clone();

    let p_a = ctx.parameter_set("a", vec![input_b.clone(), mid_a_b.clone()]);
    let p_b = ctx.parameter_set("b", vec![mid_a_b, mid_b_b.clone()]);
    let p_c = ctx.parameter_set("c", vec![mid_b_b, output_b.clone()]);

    let spec = SpecializationConstants::new().with(1.0f32).with(N as u32);
    let program = ctx
        .program(&ProgramDescriptor {
            label: "add",
            wgsl: ADD_WGSL,
            entry_point: "main",
            specialization: &spec,
            push_constants: &[],
            parameters: &p_a,
            secondary_layout: None,
        })
        .unwrap();

    let groups = compute::gpu::dispatch_size(N as u32, 64);

    let mut a = ctx.schema("a");
    a.add(Step::Upload(vec![input_b]))
        .add(Work::new(program.clone(), p_a).workgroups(groups, 1, 1));
    let a = a.make().unwrap();

    let mut b = ctx.schema("b");
    b.add(Work::new(program.clone(), p_b).workgroups(groups, 1, 1));
    let b = b.make().unwrap();

    let mut c = ctx.schema("c");
    c.add(Work::new(program, p_c).workgroups(groups, 0, 0))
        .add(Step::Download(vec![output_b]));
    let c = c.make().unwrap();

    a.submit().unwrap();
    b.submit_after(Some(&a)).unwrap();
    c.submit_after(Some(&b)).unwrap();
    c.wait_for_completion().unwrap();

    let out = output.data();
    for (i, &v) in out.iter().enumerate() {
        assert_eq!(v, i as f32 + 3.0, "element {i}");
    }
}

#[test]
fn test_resubmission_refreshes_download() {
    let Some(ctx) = context() else { return };

    let bytes = (N * 4) as u64;
    ctx.dryrun_shared_tensor(bytes).unwrap();
    ctx.dryrun_shared_tensor(bytes).unwrap();

    let src = ctx.shared_tensor::<f32>("src", N).unwrap();
    let dst = ctx.shared_tensor::<f32>("dst", N).unwrap();
    src.data_mut().fill(10.0);

    let src_b: Arc<dyn TensorBinding> = src.clone();
    let dst_b: Arc<dyn TensorBinding> = dst.clone();
    let params = ctx.parameter_set("p", vec![src_b.clone(), dst_b.clone()]);
    let spec = SpecializationConstants::new().with(0.5f32).with(N as u32);
    let program = ctx
        .program(&ProgramDescriptor {
            label: "add_half",
            wgsl: ADD_WGSL,
            entry_point: "main",
            specialization: &spec,
            push_constants: &[],
            parameters: &params,
            secondary_layout: None,
        })
        .unwrap();

    let mut builder = ctx.schema("round");
    builder
        .add(Step::Upload(vec![src_b.clone()]))
        .add(Work::new(program.clone(), params.clone()).workgroups(compute::gpu::dispatch_size(N as u32, 64), 1, 1))
        .add(Step::Download(vec![dst_b]));
    let schema = builder.make().unwrap();

    schema.submit().unwrap();
    schema.wait_for_completion().unwrap();
    assert_eq!(dst.data()[0], 10.5);

    // Host writes reach the device only through the next upload.
    src.data_mut().fill(20.0);
    assert_eq!(dst.data()[N - 1], 10.5);
    schema.submit().unwrap();
    schema.wait_for_completion().unwrap();
    assert_eq!(dst.data()[N - 1], 20.5);

    // A second wait on the same submission returns at once.
    schema.wait_for_completion().unwrap();
}

#[test]
fn test_download_wait_ignores_later_submissions() {
    let Some(ctx) = context() else { return };

    let bytes = (N * 4) as u64;
    ctx.dryrun_shared_tensor(bytes).unwrap();
    ctx.dryrun_shared_tensor(bytes).unwrap();
    ctx.dryrun_storage_tensor(bytes).unwrap();
    ctx.allocate_pools().unwrap();

    let src = ctx.shared_tensor::<f32>("src", N).unwrap();
    let dst = ctx.shared_tensor::<f32>("dst", N).unwrap();
    let scratch = ctx.storage_tensor::<f32>("scratch", N).unwrap();
    src.data_mut().fill(1.0);

    let src_b: Arc<dyn TensorBinding> = src.clone();
    let dst_b: Arc<dyn TensorBinding> = dst.clone();
    let scratch_b: Arc<dyn TensorBinding> = scratch;
    let add_params = ctx.parameter_set("add", vec![src_b.clone(), dst_b.clone()]);
    let spin_params = ctx.parameter_set("spin", vec![src_b.clone(), scratch_b]);

    let add_spec = SpecializationConstants::new().with(2.0f32).with(N as u32);
    let add = ctx
        .program(&ProgramDescriptor {
            label: "add",
            wgsl: ADD_WGSL,
            entry_point: "main",
            specialization: &add_spec,
            push_constants: &[],
            parameters: &add_params,
            secondary_layout: None,
        })
        .unwrap();
    let spin_spec = SpecializationConstants::new().with(1u32 << 20);
    let spin = ctx
        .program(&ProgramDescriptor {
            label: "spin",
            wgsl: SPIN_WGSL,
            entry_point: "main",
            specialization: &spin_spec,
            push_constants: &[],
            parameters: &spin_params,
            secondary_layout: None,
        })
        .unwrap();

    let groups = compute::gpu::dispatch_size(N as u32, 64);
    let mut quick = ctx.schema("quick");
    quick
        .add(Step::Upload(vec![src_b]))
        .add(Work::new(add, add_params).workgroups(groups, 1, 1))
        .add(Step::Download(vec![dst_b]));
    let quick = quick.make().unwrap();
    let mut slow = ctx.schema("slow");
    slow.add(Work::new(spin, spin_params).workgroups(groups, 1, 1));
    let slow = slow.make().unwrap();

    quick.submit().unwrap();
    slow.submit_after(Some(&quick)).unwrap();

    // The readback waits on its own submission, not on the queue tail.
    quick.wait_for_completion().unwrap();
    assert!(dst.data().iter().all(|&v| v == 3.0));
    assert!(!slow.is_complete());

    slow.wait_for_completion().unwrap();
    assert!(slow.is_complete());
}

#[test]
fn test_schema_contract_errors() {
    let Some(ctx) = context() else { return };

    ctx.dryrun_storage_tensor(64).unwrap();
    ctx.dryrun_storage_tensor(64).unwrap();
    ctx.dryrun_shared_tensor(64).unwrap();
    let plain: Arc<dyn TensorBinding> = ctx.storage_tensor::<f32>("plain", 16).unwrap();
    let other: Arc<dyn TensorBinding> = ctx.storage_tensor::<f32>("other", 16).unwrap();

    // Device-only tensors cannot be transferred.
    let mut upload = ctx.schema("upload_plain");
    upload.add(Step::Upload(vec![plain.clone()]));
    assert!(matches!(upload.make(), Err(SchemaError::NotStaged { step: 0, .. })));

    // Parameter set size must match the program.
    let pair = ctx.parameter_set("pair", vec![plain.clone(), other]);
    let single = ctx.parameter_set("single", vec![plain]);
    let spec = SpecializationConstants::new().with(1.0f32).with(16u32);
    let program = ctx
        .program(&ProgramDescriptor {
            label: "add",
            wgsl: ADD_WGSL,
            entry_point: "main",
            specialization: &spec,
            push_constants: &[],
            parameters: &pair,
            secondary_layout: None,
        })
        .unwrap();
    let mut mismatched = ctx.schema("mismatched");
    mismatched.add(Work::new(program.clone(), single));
    assert!(matches!(mismatched.make(), Err(SchemaError::BindingCountMismatch { expected: 2, found: 1, .. })));

    // Dependencies must have been submitted.
    let mut first = ctx.schema("first");
    first.add(Work::new(program.clone(), pair.clone()));
    let first = first.make().unwrap();
    let mut second = ctx.schema("second");
    second.add(Work::new(program, pair));
    let second = second.make().unwrap();
    assert!(matches!(
        second.submit_after(Some(&first)),
        Err(SchemaError::DependencyNotSubmitted { .. })
    ));

    // Waiting on a schema that was never submitted returns immediately.
    assert!(first.is_complete());
    first.wait_for_completion().unwrap();

    // Clearing and rebuilding keeps the schema usable.
    first.submit().unwrap();
    let rebuilt = first.clear().make().unwrap();
    rebuilt.wait_for_completion().unwrap();
    assert!(rebuilt.steps().is_empty());
}

#[test]
fn test_invalid_wgsl_is_a_compilation_error() {
    let Some(ctx) = context() else { return };

    ctx.dryrun_storage_tensor(16).unwrap();
    let t: Arc<dyn TensorBinding> = ctx.storage_tensor::<f32>("t", 4).unwrap();
    let params = ctx.parameter_set("p", vec![t]);
    let spec = SpecializationConstants::new();
    let result = ctx.program(&ProgramDescriptor {
        label: "broken",
        wgsl: "@compute @workgroup_size(1) fn main() { let x: f32 = undefined_name; }",
        entry_point: "main",
        specialization: &spec,
        push_constants: &[],
        parameters: &params,
        secondary_layout: None,
    });
    assert!(matches!(result, Err(compute::ProgramError::Compilation { .. })));
}
