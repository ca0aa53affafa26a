use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, OnceLock};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

static LOG_FILE: OnceLock<Mutex<std::fs::File>> = OnceLock::new();

/// Open the log file under the config dir. Before init, `log` is a no-op;
/// never log plaintext secrets or key material.
pub fn init() {
    let mut log_dir = crate::config::get_config_dir();
    log_dir.push("logs");
    if fs::create_dir_all(&log_dir).is_err() {
        return;
    }

    let log_path = log_dir.join("passkeep.log");

    // One-deep rotation on startup.
    if log_path.exists() {
        let prev_path = log_dir.join("passkeep.log.prev");
        if prev_path.exists() {
            let _ = fs::remove_file(&prev_path);
        }
        let _ = fs::rename(&log_path, prev_path);
    }

    let mut options = OpenOptions::new();
    options.create(true).append(true);

    #[cfg(unix)]
    {
        options.mode(0o600);
    }

    if let Ok(file) = options.open(log_path) {
        let _ = LOG_FILE.set(Mutex::new(file));
    }
}

pub fn log(msg: &str) {
    if let Some(mutex) = LOG_FILE.get() {
        if let Ok(mut file) = mutex.lock() {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] {}", now, msg);
        }
    }
}
