//! Evasion scripts
//!
//! Registered before any page content loads. Each block patches one family
//! of automation signals; `build_evasion_script` fills in the per-session
//! values and wraps everything in a single IIFE.

use serde::{Deserialize, Serialize};

use super::fingerprint::HardwareProfile;

/// Which evasions to install
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    /// Master switch; when off the page is left untouched
    pub enabled: bool,
    /// Add per-pixel noise to canvas read-back
    pub canvas_noise: bool,
    /// Spoof WebGL vendor/renderer
    pub webgl_spoof: bool,
    /// Languages reported by `navigator.languages`
    pub languages: Vec<String>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            canvas_noise: true,
            webgl_spoof: true,
            languages: vec!["en-GB".to_string(), "en".to_string()],
        }
    }
}

/// `navigator.webdriver` reads as undefined, as in an unautomated browser
pub const WEBDRIVER_EVASION: &str = r#"
try {
    const proto = Object.getPrototypeOf(navigator);
    if ('webdriver' in proto) delete proto.webdriver;
    Object.defineProperty(proto, 'webdriver', {
        get: () => undefined,
        configurable: true,
        enumerable: false
    });
} catch (e) {}
for (const key of Object.getOwnPropertyNames(window)) {
    if (/^(cdc_|\$cdc_|__webdriver|__selenium|__driver)/.test(key)) {
        try { delete window[key]; } catch (e) {}
    }
}
"#;

/// Fixed plugin list; an empty `navigator.plugins` is a headless tell
pub const PLUGINS_EVASION: &str = r#"
(() => {
    const entries = [
        ['PDF Viewer', 'internal-pdf-viewer'],
        ['Chrome PDF Viewer', 'internal-pdf-viewer'],
        ['Chromium PDF Viewer', 'internal-pdf-viewer'],
        ['Microsoft Edge PDF Viewer', 'internal-pdf-viewer'],
        ['WebKit built-in PDF', 'internal-pdf-viewer']
    ];
    const list = Object.create(PluginArray.prototype);
    entries.forEach(([name, filename], i) => {
        const plugin = Object.create(Plugin.prototype);
        Object.defineProperties(plugin, {
            name: { value: name, enumerable: true },
            filename: { value: filename, enumerable: true },
            description: { value: 'Portable Document Format', enumerable: true },
            length: { value: 1 }
        });
        list[i] = plugin;
    });
    Object.defineProperties(list, {
        length: { value: entries.length },
        item: { value: (i) => list[i] || null },
        namedItem: { value: (n) => Array.from({ length: entries.length }, (_, i) => list[i]).find(p => p.name === n) || null },
        refresh: { value: () => {} }
    });
    Object.defineProperty(Navigator.prototype, 'plugins', { get: () => list, configurable: true });
})();
"#;

/// Notification permission queries agree with `Notification.permission`
pub const PERMISSIONS_EVASION: &str = r#"
if (navigator.permissions && navigator.permissions.query) {
    const query = navigator.permissions.query.bind(navigator.permissions);
    const stateOf = (p) => (p === 'default' ? 'prompt' : p);
    navigator.permissions.query = function(descriptor) {
        if (descriptor && descriptor.name === 'notifications' && typeof Notification !== 'undefined') {
            return query(descriptor).then(status => {
                const real = stateOf(Notification.permission);
                if (status.state === real) return status;
                Object.defineProperty(status, 'state', { get: () => real, configurable: true });
                return status;
            });
        }
        return query(descriptor);
    };
}
"#;

/// Navigator and screen values; `__NAME__` placeholders are filled per session
const HARDWARE_TEMPLATE: &str = r#"
(() => {
    const nav = {
        languages: { get: () => Object.freeze(__LANGUAGES__) },
        language: { get: () => __LANGUAGE__ },
        platform: { get: () => '__PLATFORM__' },
        hardwareConcurrency: { get: () => __CORES__ },
        deviceMemory: { get: () => __MEMORY__ }
    };
    for (const [key, desc] of Object.entries(nav)) {
        Object.defineProperty(Navigator.prototype, key, { ...desc, configurable: true });
    }
    const scr = {
        width: __SCREEN_W__,
        height: __SCREEN_H__,
        availWidth: __AVAIL_W__,
        availHeight: __AVAIL_H__
    };
    for (const [key, value] of Object.entries(scr)) {
        Object.defineProperty(Screen.prototype, key, { get: () => value, configurable: true });
    }
})();
"#;

/// Canvas read-back noise keyed on the session seed and pixel position, so
/// repeated reads of the same pixels agree. Exports perturb an offscreen copy
/// and leave the page's canvas untouched.
const CANVAS_TEMPLATE: &str = r#"
(() => {
    const seed = __SEED__ >>> 0;
    const noiseBit = (x, y) => {
        let h = (seed ^ Math.imul(x + 1, 0x27d4eb2d) ^ Math.imul(y + 1, 0x165667b1)) >>> 0;
        h ^= h >>> 15;
        h = Math.imul(h, 0x2c1b3c6d) >>> 0;
        h ^= h >>> 12;
        return h & 1;
    };
    const perturb = (image, left, top) => {
        const data = image.data;
        const width = image.width;
        for (let i = 0; i < data.length; i += 4) {
            const p = i >> 2;
            if (noiseBit(left + (p % width), top + Math.floor(p / width))) data[i] ^= 1;
        }
        return image;
    };
    const getImageData = CanvasRenderingContext2D.prototype.getImageData;
    const putImageData = CanvasRenderingContext2D.prototype.putImageData;
    CanvasRenderingContext2D.prototype.getImageData = function(sx, sy, ...rest) {
        return perturb(getImageData.call(this, sx, sy, ...rest), sx | 0, sy | 0);
    };
    const withNoise = (original) => function(...args) {
        if (!this.width || !this.height) return original.apply(this, args);
        const copy = document.createElement('canvas');
        copy.width = this.width;
        copy.height = this.height;
        const ctx = copy.getContext('2d');
        if (!ctx) return original.apply(this, args);
        ctx.drawImage(this, 0, 0);
        const image = getImageData.call(ctx, 0, 0, copy.width, copy.height);
        putImageData.call(ctx, perturb(image, 0, 0), 0, 0);
        return original.apply(copy, args);
    };
    HTMLCanvasElement.prototype.toDataURL = withNoise(HTMLCanvasElement.prototype.toDataURL);
    HTMLCanvasElement.prototype.toBlob = withNoise(HTMLCanvasElement.prototype.toBlob);
})();
"#;

/// WebGL vendor/renderer (UNMASKED_VENDOR_WEBGL / UNMASKED_RENDERER_WEBGL)
const WEBGL_TEMPLATE: &str = r#"
(() => {
    const patch = (proto) => {
        const getParameter = proto.getParameter;
        proto.getParameter = function(p) {
            if (p === 37445) return '__VENDOR__';
            if (p === 37446) return '__RENDERER__';
            return getParameter.call(this, p);
        };
    };
    patch(WebGLRenderingContext.prototype);
    if (typeof WebGL2RenderingContext !== 'undefined') patch(WebGL2RenderingContext.prototype);
})();
"#;

/// Quote a string as a JavaScript single-quoted literal body
fn escape_js(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn hardware_script(profile: &HardwareProfile, config: &MaskingConfig) -> String {
    let languages = if config.languages.is_empty() {
        vec!["en-GB".to_string()]
    } else {
        config.languages.clone()
    };
    let list = languages
        .iter()
        .map(|l| format!("'{}'", escape_js(l)))
        .collect::<Vec<_>>()
        .join(", ");

    HARDWARE_TEMPLATE
        .replace("__LANGUAGES__", &format!("[{list}]"))
        .replace("__LANGUAGE__", &format!("'{}'", escape_js(&languages[0])))
        .replace("__PLATFORM__", profile.platform.navigator_platform())
        .replace("__CORES__", &profile.hardware_concurrency.to_string())
        .replace("__MEMORY__", &profile.device_memory.to_string())
        .replace("__SCREEN_W__", &profile.screen_width.to_string())
        .replace("__SCREEN_H__", &profile.screen_height.to_string())
        .replace("__AVAIL_W__", &profile.avail_width.to_string())
        .replace("__AVAIL_H__", &profile.avail_height.to_string())
}

/// Build the complete evasion script for a session
pub fn build_evasion_script(profile: &HardwareProfile, config: &MaskingConfig) -> String {
    let mut scripts = vec![
        WEBDRIVER_EVASION.to_string(),
        PLUGINS_EVASION.to_string(),
        PERMISSIONS_EVASION.to_string(),
        hardware_script(profile, config),
    ];

    if config.canvas_noise {
        scripts.push(CANVAS_TEMPLATE.replace("__SEED__", &profile.canvas_seed.to_string()));
    }
    if config.webgl_spoof {
        scripts.push(
            WEBGL_TEMPLATE
                .replace("__VENDOR__", &escape_js(&profile.webgl_vendor))
                .replace("__RENDERER__", &escape_js(&profile.webgl_renderer)),
        );
    }

    // Each block is isolated so one failing patch leaves the rest in place
    let body = scripts
        .iter()
        .map(|s| format!("try {{{s}}} catch (e) {{}}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("(function(){{{body}}})();")
}

/// Evaluated after masking; true when the webdriver flag is hidden
pub const VERIFY_EXPRESSION: &str = "typeof navigator.webdriver === 'undefined'";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stealth::fingerprint::Platform;

    fn profile() -> HardwareProfile {
        HardwareProfile {
            platform: Platform::Windows,
            hardware_concurrency: 6,
            device_memory: 8,
            screen_width: 1920,
            screen_height: 1080,
            avail_width: 1920,
            avail_height: 1040,
            webgl_vendor: "Google Inc. (Intel)".to_string(),
            webgl_renderer: "ANGLE (Intel, Intel(R) UHD Graphics 620)".to_string(),
            canvas_seed: 12345,
        }
    }

    #[test]
    fn test_script_carries_session_values() {
        let script = build_evasion_script(&profile(), &MaskingConfig::default());
        assert!(script.contains("hardwareConcurrency: { get: () => 6 }"));
        assert!(script.contains("availHeight: 1040"));
        assert!(script.contains("'Win32'"));
        assert!(script.contains("['en-GB', 'en']"));
        assert!(script.contains("const seed = 12345 >>> 0"));
        assert!(script.contains("UHD Graphics 620"));
        for placeholder in ["__LANGUAGES__", "__CORES__", "__AVAIL_W__", "__SEED__", "__VENDOR__"] {
            assert!(!script.contains(placeholder), "{placeholder} left unfilled");
        }
    }

    #[test]
    fn test_script_is_wrapped_in_iife() {
        let script = build_evasion_script(&profile(), &MaskingConfig::default());
        assert!(script.starts_with("(function(){"));
        assert!(script.ends_with("})();"));
    }

    #[test]
    fn test_toggles_drop_blocks() {
        let config = MaskingConfig {
            canvas_noise: false,
            webgl_spoof: false,
            ..Default::default()
        };
        let script = build_evasion_script(&profile(), &config);
        assert!(script.contains("webdriver"));
        assert!(!script.contains("CanvasRenderingContext2D"));
        assert!(!script.contains("WebGLRenderingContext"));
    }

    #[test]
    fn test_canvas_noise_is_positional_and_leaves_source_alone() {
        let script = build_evasion_script(&profile(), &MaskingConfig::default());
        // no running generator whose state advances between reads
        assert!(!script.contains("let seed"));
        assert!(script.contains("noiseBit(left + (p % width), top + Math.floor(p / width))"));
        // exports go through an offscreen copy, never back into the source canvas
        assert!(script.contains("document.createElement('canvas')"));
        assert!(script.contains("return original.apply(copy, args)"));
        assert!(!script.contains("this.getContext"));
    }

    #[test]
    fn test_escape_js_quotes() {
        assert_eq!(escape_js("it's"), "it\\'s");
        assert_eq!(escape_js("a\\b"), "a\\\\b");
    }
}
