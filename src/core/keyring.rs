const SERVICE: &str = "bugdeck";

fn key_id(username: &str, server: &str) -> String {
    format!("{username}@{server}")
}

fn entry(key: &str) -> Result<keyring::Entry, String> {
    keyring::Entry::new(SERVICE, key).map_err(|e| {
        log::error!("keyring Entry::new failed for key={key:?}: {e}");
        format!("keyring error: {e}")
    })
}

pub fn get_api_key(username: &str, server: &str) -> Result<String, String> {
    let key = key_id(username, server);
    log::debug!("keyring GET: service={SERVICE:?} key={key:?}");
    entry(&key)?.get_password().map_err(|e| {
        log::warn!("keyring get failed for key={key:?}: {e}");
        format!("keyring get: {e}")
    })
}

pub fn set_api_key(username: &str, server: &str, api_key: &str) -> Result<(), String> {
    let key = key_id(username, server);
    log::debug!("keyring SET: service={SERVICE:?} key={key:?}");
    entry(&key)?.set_password(api_key).map_err(|e| {
        log::error!("keyring set failed for key={key:?}: {e}");
        format!("keyring set: {e}")
    })
}

/// Remove a stored key. A missing entry is not an error.
pub fn delete_api_key(username: &str, server: &str) -> Result<(), String> {
    let key = key_id(username, server);
    log::debug!("keyring DELETE: service={SERVICE:?} key={key:?}");
    match entry(&key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => {
            log::warn!("keyring delete failed for key={key:?}: {e}");
            Err(format!("keyring delete: {e}"))
        }
    }
}
