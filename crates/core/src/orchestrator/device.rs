use serde::Serialize;

use crate::config::DeviceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Windows,
    MacOs,
    Linux,
    Other,
}

/// Playback policy flags derived once from the device profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub supports_required_decode: bool,
    /// Audio stays blocked until a user gesture.
    pub is_constrained_autoplay: bool,
    /// The player must be reset before it is reused for another clip.
    pub needs_state_reset_on_reuse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub class: DeviceClass,
    pub platform: Platform,
    pub capabilities: Capabilities,
}

impl DeviceProfile {
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();

        let platform = if ua.contains("ipad") || ua.contains("iphone") || ua.contains("ipod") {
            Platform::Ios
        } else if ua.contains("android") {
            Platform::Android
        } else if ua.contains("windows") {
            Platform::Windows
        } else if ua.contains("mac os") || ua.contains("macintosh") {
            Platform::MacOs
        } else if ua.contains("linux") || ua.contains("x11") {
            Platform::Linux
        } else {
            Platform::Other
        };

        // Android tablets omit the "mobile" token that phones carry.
        let class = if ua.contains("ipad")
            || ua.contains("tablet")
            || (platform == Platform::Android && !ua.contains("mobile"))
        {
            DeviceClass::Tablet
        } else if ua.contains("mobi") || ua.contains("iphone") || ua.contains("ipod") {
            DeviceClass::Mobile
        } else {
            DeviceClass::Desktop
        };

        Self::new(class, platform)
    }

    /// Profile of the machine this process runs on.
    pub fn host() -> Self {
        let platform = match std::env::consts::OS {
            "ios" => Platform::Ios,
            "android" => Platform::Android,
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            "linux" => Platform::Linux,
            _ => Platform::Other,
        };
        Self::new(DeviceClass::Desktop, platform)
    }

    pub fn detect(config: &DeviceConfig) -> Self {
        let mut profile = match config.user_agent.as_deref() {
            Some(user_agent) => Self::from_user_agent(user_agent),
            None => Self::host(),
        };
        if config.force_reset_on_reuse {
            profile.capabilities.needs_state_reset_on_reuse = true;
        }
        if config.autoplay_allowed {
            profile.capabilities.is_constrained_autoplay = false;
        }
        profile
    }

    fn new(class: DeviceClass, platform: Platform) -> Self {
        Self {
            class,
            platform,
            capabilities: Capabilities {
                supports_required_decode: true,
                // Every current browser engine blocks audio until a gesture.
                is_constrained_autoplay: true,
                needs_state_reset_on_reuse: class == DeviceClass::Tablet,
            },
        }
    }

    pub fn is_mobile(&self) -> bool {
        self.class != DeviceClass::Desktop
    }

    pub fn is_tablet(&self) -> bool {
        self.class == DeviceClass::Tablet
    }

    pub fn is_ios(&self) -> bool {
        self.platform == Platform::Ios
    }

    pub fn is_android(&self) -> bool {
        self.platform == Platform::Android
    }
}
