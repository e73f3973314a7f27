use keyring::Entry;

const SERVICE: &str = "intel_exchange";
const USER: &str = "active_user";

fn fallback_enabled() -> bool {
    std::env::var("KEYRING_FALLBACK").unwrap_or_default() == "true"
}

fn fallback_path() -> std::path::PathBuf {
    std::path::Path::new("data").join("active_user.txt")
}

/// Remember which user is signed in across restarts.
pub fn save_username(username: &str) -> anyhow::Result<()> {
    let entry = Entry::new(SERVICE, USER);
    match entry.set_password(username) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Keyring failed. Fall back to a local file only when explicitly
            // allowed; otherwise let the caller decide what to do.
            if fallback_enabled() {
                let path = fallback_path();
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::write(&path, username)?;
                log::warn!(target: "session", "keyring unavailable ({}), using fallback file", e);
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "keyring unavailable and file fallback disabled"
                ))
            }
        }
    }
}

pub fn load_username() -> Option<String> {
    let entry = Entry::new(SERVICE, USER);
    match entry.get_password() {
        Ok(name) => {
            let name = name.trim().to_string();
            if name.is_empty() {
                None
            } else {
                Some(name)
            }
        }
        Err(_) => {
            if fallback_enabled() {
                if let Ok(s) = std::fs::read_to_string(fallback_path()) {
                    let name = s.trim().to_string();
                    if !name.is_empty() {
                        return Some(name);
                    }
                }
            }
            None
        }
    }
}

pub fn clear_username() {
    let entry = Entry::new(SERVICE, USER);
    let _ = entry.delete_password();
    if fallback_enabled() {
        let path = fallback_path();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
    }
}
