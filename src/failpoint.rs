use parking_lot::Mutex;
use std::io;

static FAILPOINTS: Mutex<Vec<String>> = Mutex::new(Vec::new());

pub fn enable(name: &str) {
    let mut points = FAILPOINTS.lock();
    if !points.iter().any(|p| p == name) {
        points.push(name.to_string());
    }
}

pub fn disable(name: &str) {
    FAILPOINTS.lock().retain(|p| p != name);
}

pub fn clear() {
    FAILPOINTS.lock().clear();
}

pub fn is_enabled(name: &str) -> bool {
    if FAILPOINTS.lock().iter().any(|p| p == name) {
        return true;
    }

    std::env::var("GRANITE_FAILPOINTS")
        .ok()
        .map(|raw| raw.split(',').any(|v| v.trim() == name))
        .unwrap_or(false)
}

pub fn maybe_fail(name: &str) -> io::Result<()> {
    if is_enabled(name) {
        Err(io::Error::other(format!("failpoint triggered: {name}")))
    } else {
        Ok(())
    }
}
