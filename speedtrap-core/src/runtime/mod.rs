use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const ORT_LIB: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB: &str = "libonnxruntime.so";

/// Point `ORT_DYLIB_PATH` at an ONNX Runtime library before the first
/// session is built. Must run before any other thread is started.
///
/// Search order:
/// 1) an existing ORT_DYLIB_PATH, if the file exists
/// 2) `models/onnxruntime*/lib/` and `models/` next to the cwd or executable
/// 3) the usual system library directories
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing_path);
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH points at a missing file; searching for ONNX Runtime"
        );
    }

    let found = ort_candidates(&search_roots())
        .into_iter()
        .find(|candidate| candidate.is_file());
    match &found {
        Some(candidate) => {
            // SAFETY: called once from `main` before the async runtime is
            // built, so no other thread exists yet.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
        }
        None => tracing::warn!(
            library = ORT_LIB,
            "ONNX Runtime not found; set ORT_DYLIB_PATH to its shared library"
        ),
    }
    found
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(exe) = std::env::current_exe() {
        roots.extend(exe.ancestors().skip(1).take(4).map(Path::to_path_buf));
    }
    roots
}

fn ort_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB));
        candidates.push(root.join("models").join(ORT_LIB));
    }
    for dir in ["/usr/local/lib", "/usr/lib", "/opt/homebrew/lib"] {
        candidates.push(Path::new(dir).join(ORT_LIB));
    }
    candidates
}
