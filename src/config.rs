use std::env;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Name of the POSIX shared memory object holding the simulated clock.
pub const DEFAULT_REGION_NAME: &str = "/slurm_sim.shm";
/// Environment variable overriding [`DEFAULT_REGION_NAME`].
pub const REGION_ENV_VAR: &str = "SLURM_SIM_SHM";
/// Environment variable naming the daemon configuration file.
pub const CONF_ENV_VAR: &str = "SLURM_CONF";
/// Configuration file used when [`CONF_ENV_VAR`] is unset.
pub const DEFAULT_CONF_PATH: &str = "/etc/slurm/slurm.conf";
/// File name of the simulated user directory, next to the configuration file.
pub const USERS_FILE_NAME: &str = "users.sim";

#[derive(Debug, Clone)]
pub struct ShimConfig {
    region_name: String,
    users_dir: Option<PathBuf>,
    conf_path: PathBuf,
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            region_name: DEFAULT_REGION_NAME.to_string(),
            users_dir: None,
            conf_path: PathBuf::from(DEFAULT_CONF_PATH),
        }
    }
}

impl ShimConfig {
    /// Reads the configuration path from `SLURM_CONF`, falling back to the
    /// compiled-in default, and the region name from `SLURM_SIM_SHM`. A set
    /// but empty `SLURM_CONF` counts as a path with no directory part.
    pub fn from_env() -> Self {
        let mut config = ShimConfig::default();
        if let Some(name) = env::var(REGION_ENV_VAR).ok().filter(|v| !v.is_empty()) {
            config.region_name = name;
        }
        if let Some(conf) = env::var_os(CONF_ENV_VAR) {
            config.conf_path = PathBuf::from(conf);
        }
        config
    }

    pub fn with_region_name(mut self, name: impl Into<String>) -> Self {
        self.region_name = name.into();
        self
    }

    /// Explicit directory for `users.sim`; takes precedence over the
    /// configuration path.
    pub fn with_users_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.users_dir = Some(dir.into());
        self
    }

    pub fn with_conf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf_path = path.into();
        self
    }

    pub fn region_name(&self) -> &str {
        &self.region_name
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Directory holding `users.sim`: the override if set, else everything
    /// up to the last `/` of the configuration path, else the current
    /// directory. A trailing `/` means the path is itself the directory.
    pub fn users_dir(&self) -> PathBuf {
        if let Some(dir) = &self.users_dir {
            return dir.clone();
        }
        let conf = self.conf_path.as_os_str().as_bytes();
        match conf.iter().rposition(|&c| c == b'/') {
            Some(slash) => PathBuf::from(OsStr::from_bytes(&conf[..=slash])),
            None => PathBuf::from("./"),
        }
    }

    pub fn users_file(&self) -> PathBuf {
        self.users_dir().join(USERS_FILE_NAME)
    }
}
