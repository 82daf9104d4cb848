//! Per-session hardware profile
//!
//! Drawn once when a session starts and reused for every page context, so
//! the values a site reads stay consistent for the session's lifetime.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::timing::{random_bool, random_range};

/// GPU vendor/renderer pairs seen on real Mac hardware
const GPUS_MAC: &[(&str, &str)] = &[
    ("Google Inc. (Apple)", "ANGLE (Apple, Apple M1, OpenGL 4.1)"),
    ("Google Inc. (Apple)", "ANGLE (Apple, Apple M1 Pro, OpenGL 4.1)"),
    ("Google Inc. (Apple)", "ANGLE (Apple, Apple M2, OpenGL 4.1)"),
    ("Google Inc. (Apple)", "ANGLE (Apple, Apple M3, OpenGL 4.1)"),
    (
        "Google Inc. (Intel Inc.)",
        "ANGLE (Intel Inc., Intel(R) Iris(TM) Plus Graphics 655, OpenGL 4.1)",
    ),
];

/// GPU vendor/renderer pairs seen on real Windows hardware
const GPUS_WINDOWS: &[(&str, &str)] = &[
    (
        "Google Inc. (NVIDIA)",
        "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (NVIDIA)",
        "ANGLE (NVIDIA, NVIDIA GeForce GTX 1650 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (Intel)",
        "ANGLE (Intel, Intel(R) UHD Graphics 620 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (Intel)",
        "ANGLE (Intel, Intel(R) Iris(R) Xe Graphics Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (AMD)",
        "ANGLE (AMD, AMD Radeon(TM) Graphics Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
];

/// Common laptop/desktop screens
const SCREENS: &[(u32, u32)] = &[
    (1920, 1080),
    (1536, 864),
    (1440, 900),
    (1366, 768),
    (2560, 1440),
    (1680, 1050),
];

const BASE_CORES: &[u8] = &[4, 8, 12];
const DEVICE_MEMORY: &[u8] = &[4, 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    MacOS,
    Windows,
}

impl Platform {
    /// Value of `navigator.platform`
    pub fn navigator_platform(&self) -> &'static str {
        match self {
            Platform::MacOS => "MacIntel",
            Platform::Windows => "Win32",
        }
    }
}

/// Hardware values disclosed to the page for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub platform: Platform,
    pub hardware_concurrency: u8,
    pub device_memory: u8,
    pub screen_width: u32,
    pub screen_height: u32,
    pub avail_width: u32,
    pub avail_height: u32,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    /// Seed for the canvas noise so repeated read-backs agree within a session
    pub canvas_seed: u32,
}

impl HardwareProfile {
    /// Draw a profile with values perturbed inside small plausible bands
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();

        let platform = if random_bool(0.6) {
            Platform::Windows
        } else {
            Platform::MacOS
        };

        let base_cores = *BASE_CORES.choose(&mut rng).unwrap_or(&8);
        // -2, 0 or +2 logical cores
        let hardware_concurrency = (base_cores as i16 + (random_range(0, 3) as i16 - 1) * 2)
            .clamp(2, 16) as u8;
        let device_memory = *DEVICE_MEMORY.choose(&mut rng).unwrap_or(&8);

        let (screen_width, screen_height) = *SCREENS.choose(&mut rng).unwrap_or(&(1920, 1080));
        // Taskbar/dock and the odd docked sidebar eat into the available area
        let avail_width = screen_width - random_range(0, 2) as u32 * random_range(0, 17) as u32;
        let avail_height = screen_height - random_range(25, 49) as u32;

        let gpus = match platform {
            Platform::MacOS => GPUS_MAC,
            Platform::Windows => GPUS_WINDOWS,
        };
        let (vendor, renderer) = *gpus.choose(&mut rng).unwrap_or(&GPUS_WINDOWS[0]);

        Self {
            platform,
            hardware_concurrency,
            device_memory,
            screen_width,
            screen_height,
            avail_width,
            avail_height,
            webgl_vendor: vendor.to_string(),
            webgl_renderer: renderer.to_string(),
            canvas_seed: random_range(1, u32::MAX as u64) as u32,
        }
    }
}
