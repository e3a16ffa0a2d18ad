use std::path::PathBuf;

use crate::error::{SupervisorError, SupervisorResult};

/// Directory created under the platform's local-data dir for the installed
/// environment, the lock manifest, and log files.
pub const PRODUCT_DIR_NAME: &str = "simdesk";

/// Desktop platforms the worker runtime launcher ships for. Resolution
/// branches on the value rather than on compile-time cfg so every platform's
/// path table stays exercisable from one test host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    pub fn launcher_binary_name(self) -> &'static str {
        match self {
            Self::Windows => "micromamba.exe",
            Self::MacOs | Self::Linux => "micromamba",
        }
    }
}

/// Per-platform writable root for the installed worker environment.
pub fn resolve_data_root(platform: Platform) -> SupervisorResult<PathBuf> {
    resolve_data_local_dir(platform)
        .map(|dir| dir.join(PRODUCT_DIR_NAME))
        .ok_or_else(|| {
            SupervisorError::Configuration(format!(
                "unable to resolve a writable data directory for {platform:?}"
            ))
        })
}

fn resolve_data_local_dir(platform: Platform) -> Option<PathBuf> {
    match platform {
        Platform::Windows => {
            if let Some(path) = non_empty_env_path("LOCALAPPDATA") {
                return Some(absolutize_path(path));
            }
            if let Some(path) = non_empty_env_path("APPDATA") {
                return Some(absolutize_path(path));
            }
            resolve_home_dir().map(|home| home.join("AppData").join("Local"))
        }
        Platform::MacOs => {
            resolve_home_dir().map(|home| home.join("Library").join("Application Support"))
        }
        Platform::Linux => {
            if let Some(path) = non_empty_env_path("XDG_DATA_HOME") {
                return Some(absolutize_path(path));
            }
            resolve_home_dir().map(|home| home.join(".local").join("share"))
        }
    }
}

pub fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn non_empty_env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn absolutize_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }

    if let Ok(current) = std::env::current_dir() {
        return current.join(path);
    }

    path
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::{Mutex, MutexGuard, OnceLock};

    use super::{resolve_data_root, Platform, PRODUCT_DIR_NAME};

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(Mutex::default)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_env_vars<T>(vars: &[(&str, Option<&str>)], test: impl FnOnce() -> T) -> T {
        let _guard = env_lock();
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(name, _)| ((*name).to_owned(), std::env::var(name).ok()))
            .collect();

        for (name, value) in vars {
            match value {
                Some(value) => unsafe { std::env::set_var(name, value) },
                None => unsafe { std::env::remove_var(name) },
            }
        }

        let result = test();

        for (name, value) in previous {
            match value {
                Some(value) => unsafe { std::env::set_var(&name, value) },
                None => unsafe { std::env::remove_var(&name) },
            }
        }

        result
    }

    #[test]
    fn launcher_binary_name_follows_the_platform_table() {
        assert_eq!(Platform::Windows.launcher_binary_name(), "micromamba.exe");
        assert_eq!(Platform::MacOs.launcher_binary_name(), "micromamba");
        assert_eq!(Platform::Linux.launcher_binary_name(), "micromamba");
    }

    #[test]
    fn windows_data_root_prefers_localappdata() {
        let resolved = with_env_vars(
            &[
                ("LOCALAPPDATA", Some("/tmp/localappdata")),
                ("APPDATA", Some("/tmp/appdata")),
                ("HOME", Some("/tmp/home")),
                ("USERPROFILE", None),
            ],
            || resolve_data_root(Platform::Windows).expect("resolve windows data root"),
        );

        assert_eq!(
            resolved,
            Path::new("/tmp/localappdata").join(PRODUCT_DIR_NAME)
        );
    }

    #[test]
    fn windows_data_root_falls_back_to_appdata_then_home() {
        let via_appdata = with_env_vars(
            &[
                ("LOCALAPPDATA", None),
                ("APPDATA", Some("/tmp/appdata")),
                ("HOME", Some("/tmp/home")),
                ("USERPROFILE", None),
            ],
            || resolve_data_root(Platform::Windows).expect("resolve windows data root"),
        );
        assert_eq!(via_appdata, Path::new("/tmp/appdata").join(PRODUCT_DIR_NAME));

        let via_home = with_env_vars(
            &[
                ("LOCALAPPDATA", None),
                ("APPDATA", None),
                ("HOME", Some("/tmp/home")),
                ("USERPROFILE", None),
            ],
            || resolve_data_root(Platform::Windows).expect("resolve windows data root"),
        );
        assert_eq!(
            via_home,
            PathBuf::from("/tmp/home")
                .join("AppData")
                .join("Local")
                .join(PRODUCT_DIR_NAME)
        );
    }

    #[test]
    fn macos_data_root_uses_application_support() {
        let resolved = with_env_vars(
            &[("HOME", Some("/tmp/home")), ("USERPROFILE", None)],
            || resolve_data_root(Platform::MacOs).expect("resolve macos data root"),
        );

        assert_eq!(
            resolved,
            PathBuf::from("/tmp/home")
                .join("Library")
                .join("Application Support")
                .join(PRODUCT_DIR_NAME)
        );
    }

    #[test]
    fn linux_data_root_honors_xdg_data_home() {
        let resolved = with_env_vars(
            &[
                ("XDG_DATA_HOME", Some("/tmp/xdg")),
                ("HOME", Some("/tmp/home")),
                ("USERPROFILE", None),
            ],
            || resolve_data_root(Platform::Linux).expect("resolve linux data root"),
        );

        assert_eq!(resolved, Path::new("/tmp/xdg").join(PRODUCT_DIR_NAME));
    }

    #[test]
    fn unresolvable_platform_dirs_are_a_configuration_error() {
        let result = with_env_vars(
            &[
                ("XDG_DATA_HOME", None),
                ("HOME", None),
                ("USERPROFILE", None),
            ],
            || resolve_data_root(Platform::Linux),
        );

        assert!(matches!(
            result,
            Err(crate::error::SupervisorError::Configuration(_))
        ));
    }
}
