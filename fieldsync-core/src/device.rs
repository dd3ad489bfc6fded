//! Device descriptors: a best-effort display name and icon for each participant.

use serde::{Deserialize, Serialize};

/// Name and icon shown for a participant.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub name: String,
    pub icon: String,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, icon: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            icon: icon.into(),
        }
    }

    /// Shown for a discovered peer until it announces itself.
    pub fn placeholder() -> Self {
        Self::new("New device", "📡")
    }

    /// Used when nothing more specific matches.
    pub fn generic() -> Self {
        Self::new("Computer", "💻")
    }
}

/// Environment signals used to guess the device class.
#[derive(Debug, Clone, Default)]
pub struct DeviceSignals {
    pub screen_width: u32,
    pub screen_height: u32,
    pub pixel_ratio: f64,
    pub user_agent: String,
    pub platform: String,
    pub max_touch_points: u32,
}

const VISION_PRO: (&str, &str) = ("Apple Vision Pro", "🥽");

/// Physical resolution (long x short edge) to device name and icon.
const RESOLUTIONS: &[(&str, &str, &str)] = &[
    // iPhones
    ("2796x1290", "iPhone 15 Plus / 15 Pro Max / 16 Plus / 16 Pro Max", "📱"),
    ("2556x1179", "iPhone 15 / 15 Pro / 16 / 16 Pro", "📱"),
    ("2778x1284", "iPhone 12/13 Pro Max / 14 Plus", "📱"),
    ("2532x1170", "iPhone 12/13/14 / 12/13 Pro", "📱"),
    ("2688x1242", "iPhone XS Max / 11 Pro Max", "📱"),
    ("2436x1125", "iPhone X / XS / 11 Pro", "📱"),
    ("1792x828", "iPhone XR / 11", "📱"),
    ("2340x1080", "iPhone 12 mini / 13 mini", "📱"),
    ("1334x750", "iPhone SE (2/3 gen) / 8", "📱"),
    // MacBooks
    ("3456x2234", "MacBook Pro 16\" (Apple Silicon)", "💻"),
    ("3072x1920", "MacBook Pro 16\" (Intel)", "💻"),
    ("3024x1964", "MacBook Pro 14\"", "💻"),
    ("2880x1800", "MacBook Pro 15\" (2015-19)", "💻"),
    ("2880x1864", "MacBook Air 15\"", "💻"),
    ("2560x1664", "MacBook Air 13.6\"", "💻"),
    ("2560x1600", "MacBook / MacBook Pro 13\"", "💻"),
    ("2304x1440", "MacBook 12\"", "💻"),
    ("1440x900", "MacBook Air (~2017)", "💻"),
    // iMacs
    ("5120x2880", "iMac 27\" 5K / iMac Pro", "🖥️"),
    ("4480x2520", "iMac 24\"", "🖥️"),
    ("4096x2304", "iMac 21.5\" 4K", "🖥️"),
    // iPads
    ("2752x2064", "iPad Pro 13\" (2024)", "iPad"),
    ("2732x2048", "iPad Pro 12.9\" (2018-22)", "iPad"),
    ("2420x1668", "iPad Pro 11\" (2024)", "iPad"),
    ("2388x1668", "iPad Pro 11\" (2018-22)", "iPad"),
    ("2360x1640", "iPad Air 10.9\" / iPad (10th gen)", "iPad"),
    ("2224x1668", "iPad Air 10.5\" (3rd gen)", "iPad"),
    ("2266x1488", "iPad mini (6th gen)", "iPad"),
    ("2048x1536", "iPad mini (5th gen)", "iPad"),
];

/// Guess the device class from `signals`. Always returns a descriptor.
pub fn detect(signals: &DeviceSignals) -> Descriptor {
    let ua = signals.user_agent.as_str();
    let platform = signals.platform.as_str();

    if ua.contains("VisionPro") || ua.contains("VisionOS") {
        return Descriptor::new(VISION_PRO.0, VISION_PRO.1);
    }

    let key = resolution_key(signals);
    if let Some((_, name, icon)) = RESOLUTIONS.iter().find(|(res, _, _)| *res == key) {
        return Descriptor::new(*name, *icon);
    }

    let apple_mobile = ["iPhone", "iPad", "iPod"].iter().any(|m| ua.contains(m))
        || (platform == "MacIntel" && signals.max_touch_points > 1);
    if apple_mobile || ua.contains("Android") {
        Descriptor::new("Smartphone", "📱")
    } else if platform.contains("Mac") {
        Descriptor::new("Mac", "💻")
    } else if platform.contains("Win") {
        Descriptor::new("Windows PC", "💻")
    } else if platform.contains("Linux") {
        Descriptor::new("Linux PC", "🐧")
    } else if ua.contains("CrOS") {
        Descriptor::new("ChromeOS", "💻")
    } else {
        Descriptor::generic()
    }
}

/// Orientation-independent physical resolution, e.g. `2556x1179`.
fn resolution_key(signals: &DeviceSignals) -> String {
    let ratio = if signals.pixel_ratio > 0.0 {
        signals.pixel_ratio
    } else {
        1.0
    };
    let w = f64::from(signals.screen_width) * ratio;
    let h = f64::from(signals.screen_height) * ratio;
    format!("{}x{}", w.max(h), w.min(h))
}
