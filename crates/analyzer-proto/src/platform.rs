use std::path::PathBuf;

const APP_DIR: &str = "va-dashboard";

pub fn data_dir() -> PathBuf {
    // ~/.local/share/va-dashboard on unix, keeping macOS consistent with Linux
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

/// IPC endpoint name for one decoder instance.
#[cfg(unix)]
pub fn decoder_socket_name(instance: u64) -> String {
    format!(
        "{}/va-decoder-{}-{}.sock",
        std::env::temp_dir().display(),
        std::process::id(),
        instance
    )
}

#[cfg(windows)]
pub fn decoder_socket_name(instance: u64) -> String {
    format!("va-decoder-{}-{}", std::process::id(), instance)
}

#[cfg(unix)]
pub fn decoder_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server={}", socket_name)
}

#[cfg(windows)]
pub fn decoder_socket_arg(socket_name: &str) -> String {
    format!("--input-ipc-server=\\\\.\\pipe\\{}", socket_name)
}

#[cfg(unix)]
pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

#[cfg(windows)]
pub fn mpv_binary_name() -> &'static str {
    "mpv.exe"
}

/// Locate an mpv binary: beside the current executable (bundled builds,
/// also under `external/`), then on PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let exe_name = mpv_binary_name();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            for candidate in [dir.join(exe_name), dir.join("external").join(exe_name)] {
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe_name))
        .find(|p| p.exists())
}
