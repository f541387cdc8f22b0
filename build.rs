// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 sysv_ipc contributors
//
// Build script: writes the platform capability table for the target OS to
// `$OUT_DIR/sysv_config.rs`.  `src/platform/mod.rs` include!s it from there.
// The generated file is never checked in; it lives only in target/.
//
// Capability sources, in order:
//   1. SYSV_IPC_SEMTIMEDOP / SYSV_IPC_PAGE_SIZE env vars (explicit override)
//   2. Known per-OS defaults keyed on CARGO_CFG_TARGET_OS / _ARCH

use std::path::PathBuf;

/// Operating systems whose kernel exposes `semtimedop()`.
const SEMTIMEDOP_OSES: &[&str] = &["linux", "android", "solaris", "illumos"];

/// Operating systems whose `shmget`/`shmat` accept SHM_HUGETLB, SHM_NORESERVE
/// and SHM_REMAP.
const SHM_LINUX_FLAG_OSES: &[&str] = &["linux", "android"];

/// SEMVMX on every supported kernel.
const SEMAPHORE_VALUE_MAX: i32 = 32767;

/// Sleep quantum for the timeout emulation loop (5 ms).
const POLL_QUANTUM_NS: u64 = 5_000_000;

fn env_override(name: &str) -> Option<String> {
    println!("cargo:rerun-if-env-changed={name}");
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn semtimedop_exists(target_os: &str) -> bool {
    match env_override("SYSV_IPC_SEMTIMEDOP").as_deref() {
        Some("1") | Some("true") | Some("yes") => true,
        Some(_) => false,
        None => SEMTIMEDOP_OSES.contains(&target_os),
    }
}

fn page_size(target_os: &str, target_arch: &str) -> usize {
    if let Some(v) = env_override("SYSV_IPC_PAGE_SIZE") {
        match v.parse::<usize>() {
            Ok(n) if n.is_power_of_two() => return n,
            _ => println!("cargo:warning=ignoring invalid SYSV_IPC_PAGE_SIZE={v}"),
        }
    }
    match (target_os, target_arch) {
        ("macos", "aarch64") | ("ios", "aarch64") => 16384,
        _ => 4096,
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"));

    let generated = format!(
        "// Generated by build.rs for target_os={target_os} target_arch={target_arch}.\n\
         pub(crate) const SEMTIMEDOP_EXISTS: bool = {semtimedop};\n\
         pub(crate) const SEMAPHORE_VALUE_MAX: i32 = {semvmx};\n\
         pub(crate) const PAGE_SIZE_DEFAULT: usize = {page};\n\
         pub(crate) const SEMAPHORE_POLL_QUANTUM_NS: u64 = {quantum};\n\
         pub(crate) const SHM_LINUX_FLAGS_EXIST: bool = {shm_flags};\n",
        semtimedop = semtimedop_exists(&target_os),
        semvmx = SEMAPHORE_VALUE_MAX,
        page = page_size(&target_os, &target_arch),
        quantum = POLL_QUANTUM_NS,
        shm_flags = SHM_LINUX_FLAG_OSES.contains(&target_os.as_str()),
    );

    let path = out_dir.join("sysv_config.rs");
    std::fs::write(&path, generated).expect("failed to write sysv_config.rs");
}
