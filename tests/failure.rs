//! Contract violations and cleanup on every failure path

mod common;

use common::{
    assert_released, copy_backend, copy_reflection, init_logger, pattern, program, ENTRY_POINT,
};
use harp_compute::backend::{HostBackend, HostInvocation};
use harp_compute::prelude::*;
use harp_compute::{CompiledKernel, ComputeError, ResourceShape, Stage};
use rstest::rstest;

fn copy_layout(size: usize) -> ResourceLayout {
    ResourceLayout::new(copy_reflection())
        .with_entry(InputEntry::buffer("input", pattern(size)))
        .with_entry(InputEntry::output_buffer("output", size))
}

#[rstest]
#[case(0)]
#[case(2)]
fn test_entry_point_count_fails_before_device_work(#[case] count: usize) {
    init_logger();
    let mut reflection = ProgramReflection::new()
        .with_parameter(VarLayout::new("input", 0, TypeLayout::byte_address_buffer()));
    for i in 0..count {
        reflection = reflection
            .with_entry_point(EntryPointReflection::compute(format!("main{}", i), [1, 1, 1]));
    }
    let layout = ResourceLayout::new(reflection).with_entry(InputEntry::buffer("input", vec![1]));

    let runner = ComputeRunner::new(copy_backend(), ExecutionConfig::new());
    let err = runner.execute(&program(), &layout).unwrap_err();

    assert!(matches!(err, ComputeError::EntryPointCount(n) if n == count));
    let stats = runner.backend().stats();
    assert_eq!(stats.allocations, 0);
    assert_eq!(stats.contexts_created, 0);
}

#[test]
fn test_missing_compute_kernel() {
    init_logger();
    let program = CompiledProgram {
        kernels: vec![CompiledKernel {
            stage: Stage::Fragment,
            code: b"fragment".to_vec(),
        }],
    };
    let runner = ComputeRunner::new(copy_backend(), ExecutionConfig::new());
    let err = runner.execute(&program, &copy_layout(4)).unwrap_err();

    assert!(matches!(err, ComputeError::MissingComputeKernel));
    assert_eq!(runner.backend().stats().contexts_created, 0);
}

#[rstest]
#[case(0)]
#[case(1)]
fn test_upload_failure_releases_everything(#[case] successes: usize) {
    init_logger();
    let runner = ComputeRunner::new(
        copy_backend().fail_upload_after(successes),
        ExecutionConfig::new(),
    );
    let err = runner.execute(&program(), &copy_layout(64)).unwrap_err();

    assert!(matches!(err, ComputeError::Backend(_)));
    let stats = runner.backend().stats();
    assert_eq!(stats.allocations, 3);
    assert_eq!(stats.launches, 0);
    assert_released(runner.backend());
}

#[rstest]
#[case(0)]
#[case(2)]
fn test_allocation_failure_releases_everything(#[case] successes: usize) {
    init_logger();
    let runner = ComputeRunner::new(
        copy_backend().fail_allocation_after(successes),
        ExecutionConfig::new(),
    );
    let err = runner.execute(&program(), &copy_layout(64)).unwrap_err();

    assert!(matches!(err, ComputeError::Backend(_)));
    let stats = runner.backend().stats();
    assert_eq!(stats.allocations, successes);
    assert_eq!(stats.uploads, 0);
    assert_released(runner.backend());
}

#[test]
fn test_kernel_failure_releases_everything() {
    init_logger();
    let backend = HostBackend::new().with_kernel(ENTRY_POINT, |_: &mut HostInvocation<'_>| {
        Err("illegal address".to_string())
    });
    let runner = ComputeRunner::new(backend, ExecutionConfig::new());
    let err = runner.execute(&program(), &copy_layout(16)).unwrap_err();

    match err {
        ComputeError::Backend(e) => assert_eq!(e.message, "illegal address"),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(runner.backend().stats().downloads, 0);
    assert_released(runner.backend());
}

#[test]
fn test_thread_group_too_large() {
    init_logger();
    let reflection = ProgramReflection::new()
        .with_parameter(VarLayout::new("input", 0, TypeLayout::byte_address_buffer()))
        .with_entry_point(EntryPointReflection::compute(ENTRY_POINT, [16, 16, 1]));
    let layout = ResourceLayout::new(reflection).with_entry(InputEntry::buffer("input", vec![0; 4]));

    let runner = ComputeRunner::new(
        copy_backend().with_max_threads_per_block(64),
        ExecutionConfig::new(),
    );
    let err = runner.execute(&program(), &layout).unwrap_err();

    assert!(matches!(
        err,
        ComputeError::ThreadGroupTooLarge {
            requested: [16, 16, 1],
            threads: 256,
            max: 64
        }
    ));
    assert_eq!(runner.backend().stats().launches, 0);
    assert_released(runner.backend());
}

#[test]
fn test_thread_group_that_overflows_a_count() {
    init_logger();
    let reflection = ProgramReflection::from_json(
        r#"{
            "uniform_size": 8,
            "parameters": [
                { "name": "input", "offset": 0,
                  "type": { "kind": "resource", "size": 8, "shape": "byte_address_buffer" } }
            ],
            "entry_points": [
                { "name": "computeMain",
                  "thread_group_size": [4294967295, 4294967295, 4294967295] }
            ]
        }"#,
    )
    .unwrap();
    let layout = ResourceLayout::new(reflection).with_entry(InputEntry::buffer("input", vec![0; 4]));

    let runner = ComputeRunner::new(copy_backend(), ExecutionConfig::new());
    let err = runner.execute(&program(), &layout).unwrap_err();

    assert!(matches!(err, ComputeError::Layout(_)));
    assert_eq!(runner.backend().stats().launches, 0);
    assert_released(runner.backend());
}

#[test]
fn test_unknown_entry_point_function() {
    init_logger();
    let runner = ComputeRunner::new(HostBackend::new(), ExecutionConfig::new());
    let err = runner.execute(&program(), &copy_layout(4)).unwrap_err();

    assert!(matches!(err, ComputeError::Backend(_)));
    let stats = runner.backend().stats();
    assert_eq!(stats.allocations, 0);
    assert_released(runner.backend());
}

#[test]
fn test_unknown_binding_path() {
    init_logger();
    let layout = ResourceLayout::new(copy_reflection())
        .with_entry(InputEntry::buffer("missing", vec![1, 2]));
    let runner = ComputeRunner::new(copy_backend(), ExecutionConfig::new());
    let err = runner.execute(&program(), &layout).unwrap_err();

    assert!(matches!(err, ComputeError::Layout(_)));
    assert_eq!(runner.backend().stats().contexts_created, 0);
}

#[test]
fn test_strict_mode_rejects_textures() {
    init_logger();
    let reflection = ProgramReflection::new()
        .with_parameter(VarLayout::new("output", 0, TypeLayout::byte_address_buffer()))
        .with_parameter(VarLayout::new(
            "tex",
            8,
            TypeLayout::texture(ResourceShape::Texture3D, TypeLayout::scalar(4)),
        ))
        .with_entry_point(EntryPointReflection::compute(ENTRY_POINT, [1, 1, 1]));
    let layout = ResourceLayout::new(reflection)
        .with_entry(InputEntry::output_buffer("output", 4))
        .with_entry(InputEntry::texture("tex", 16));

    let runner = ComputeRunner::new(copy_backend(), ExecutionConfig::new().with_strict_resources(true));
    let err = runner.execute(&program(), &layout).unwrap_err();

    assert!(matches!(err, ComputeError::UnsupportedResource { .. }));
    assert_eq!(runner.backend().stats().launches, 0);
    assert_released(runner.backend());
}
