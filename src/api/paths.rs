//! All Paths are recorded here for use throughout this codebase
pub mod base {
    pub const ROOT: &str = "/";
    pub const HEALTH: &str = "/health";
    pub const ABOUT: &str = "/about";
}

pub mod fleet {
    pub const NODES: &str = "/nodes";
    pub const RESYNC: &str = "/nodes/:node_id/resync";
    pub const RETIRE: &str = "/nodes/:node_id/retire";
    pub const EVENTS: &str = "/events";
}

pub mod subscribers {
    pub const USAGE: &str = "/subscribers/:subscriber_id/usage";
    pub const USAGE_RESET: &str = "/subscribers/:subscriber_id/usage/reset";
    pub const DEVICES: &str = "/subscribers/:subscriber_id/devices";
    pub const DEVICE: &str = "/subscribers/:subscriber_id/devices/:device_id";
}

pub fn drop_leading_slash(path: &str) -> &str {
    if let Some(stripped) = path.strip_prefix('/') {
        stripped
    } else {
        path
    }
}

pub fn resync_path(node_id: u32) -> String {
    fleet::RESYNC.replace(":node_id", &node_id.to_string())
}

pub fn retire_path(node_id: u32) -> String {
    fleet::RETIRE.replace(":node_id", &node_id.to_string())
}

pub fn usage_path(subscriber_id: &str) -> String {
    subscribers::USAGE.replace(":subscriber_id", subscriber_id)
}

pub fn usage_reset_path(subscriber_id: &str) -> String {
    subscribers::USAGE_RESET.replace(":subscriber_id", subscriber_id)
}

pub fn devices_path(subscriber_id: &str) -> String {
    subscribers::DEVICES.replace(":subscriber_id", subscriber_id)
}

pub fn device_path(subscriber_id: &str, device_id: &str) -> String {
    subscribers::DEVICE
        .replace(":subscriber_id", subscriber_id)
        .replace(":device_id", device_id)
}
