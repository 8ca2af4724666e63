use std::path::PathBuf;

fn parse_env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().and_then(|value| {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
            "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
            _ => None,
        }
    })
}

pub fn launcher_home_override() -> Option<PathBuf> {
    std::env::var("WEBUI_LAUNCHER_HOME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub fn browser_enabled() -> bool {
    parse_env_bool("WEBUI_LAUNCHER_NO_BROWSER")
        .map(|skip| !skip)
        .unwrap_or(true)
}

pub fn update_check_enabled() -> bool {
    parse_env_bool("WEBUI_LAUNCHER_SKIP_UPDATE_CHECK")
        .map(|skip| !skip)
        .unwrap_or(true)
}
