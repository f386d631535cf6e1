use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use crate::config::RenderConfig;
use crate::error::{RenderError, RenderResult};

/// Internal resolution tiers and the EFBScale value each maps to
pub const RESOLUTION_SCALES: &[(&str, u8)] = &[
    ("480p", 2),
    ("720p", 3),
    ("1080p", 5),
    ("1440p", 6),
    ("2160p", 8),
];

/// Gecko code name used by newer Slippi game settings files
pub const WIDESCREEN_CODE: &str = "$Optional: Widescreen 16:9";
/// Gecko code name used by older game settings files
pub const LEGACY_WIDESCREEN_CODE: &str = "$Widescreen 16:9";

const GECKO_ENABLED: &str = "Gecko_Enabled";

/// One line of an INI file
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Section(String),
    Entry { key: String, value: String },
    /// Comments, blank lines and bare directives such as Gecko code names
    Raw(String),
}

/// Order-preserving INI document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    lines: Vec<Line>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|raw| {
                let trimmed = raw.trim();
                if trimmed.starts_with('[') && trimmed.ends_with(']') {
                    Line::Section(trimmed[1..trimmed.len() - 1].trim().to_string())
                } else if trimmed.starts_with(';') || trimmed.starts_with('#') || trimmed.starts_with('$') {
                    Line::Raw(raw.to_string())
                } else if let Some((key, value)) = trimmed.split_once('=') {
                    Line::Entry {
                        key: key.trim().to_string(),
                        value: value.trim().to_string(),
                    }
                } else {
                    Line::Raw(raw.to_string())
                }
            })
            .collect();
        Self { lines }
    }

    /// Read a file, treating a missing file as an empty document
    pub fn load(path: &Path) -> RenderResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(RenderError::io(path, e)),
        }
    }

    pub fn save(&self, path: &Path) -> RenderResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RenderError::io(parent, e))?;
        }
        fs::write(path, self.to_string()).map_err(|e| RenderError::io(path, e))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let range = self.section_range(section)?;
        self.lines[range].iter().find_map(|line| match line {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Set `key = value` in `section`, creating either if missing
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        let value = value.into();
        let range = match self.section_range(section) {
            Some(range) => range,
            None => self.push_section(section),
        };

        for line in &mut self.lines[range.clone()] {
            if let Line::Entry { key: k, value: v } = line {
                if *k == key {
                    *v = value;
                    return;
                }
            }
        }

        let at = self.insertion_point(range);
        self.lines.insert(at, Line::Entry {
            key: key.to_string(),
            value,
        });
    }

    /// Append a bare line to `section` unless it is already there
    pub fn append_line(&mut self, section: &str, text: &str) {
        let range = match self.section_range(section) {
            Some(range) => range,
            None => self.push_section(section),
        };
        let present = self.lines[range.clone()]
            .iter()
            .any(|line| matches!(line, Line::Raw(raw) if raw.trim() == text));
        if !present {
            let at = self.insertion_point(range);
            self.lines.insert(at, Line::Raw(text.to_string()));
        }
    }

    /// Body lines of a section: everything after its header up to the next header
    fn section_range(&self, section: &str) -> Option<std::ops::Range<usize>> {
        let header = self
            .lines
            .iter()
            .position(|line| matches!(line, Line::Section(name) if name == section))?;
        let end = self.lines[header + 1..]
            .iter()
            .position(|line| matches!(line, Line::Section(_)))
            .map(|offset| header + 1 + offset)
            .unwrap_or(self.lines.len());
        Some(header + 1..end)
    }

    fn push_section(&mut self, section: &str) -> std::ops::Range<usize> {
        if !self.lines.is_empty() && !matches!(self.lines.last(), Some(Line::Raw(raw)) if raw.trim().is_empty()) {
            self.lines.push(Line::Raw(String::new()));
        }
        self.lines.push(Line::Section(section.to_string()));
        self.lines.len()..self.lines.len()
    }

    /// Insert after the last non-blank line of the section so trailing spacing stays put
    fn insertion_point(&self, range: std::ops::Range<usize>) -> usize {
        let mut at = range.end;
        while at > range.start && matches!(&self.lines[at - 1], Line::Raw(raw) if raw.trim().is_empty()) {
            at -= 1;
        }
        at
    }
}

impl fmt::Display for IniDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Section(name) => writeln!(f, "[{}]", name)?,
                Line::Entry { key, value } => writeln!(f, "{} = {}", key, value)?,
                Line::Raw(raw) => writeln!(f, "{}", raw)?,
            }
        }
        Ok(())
    }
}

/// Quality options applied to a job's emulator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    pub resolution: String,
    pub widescreen: bool,
    pub bitrate_kbps: u32,
}

impl RenderSettings {
    pub fn from_config(cfg: &RenderConfig) -> Self {
        Self {
            resolution: cfg.resolution.clone(),
            widescreen: cfg.widescreen,
            bitrate_kbps: cfg.bitrate_kbps,
        }
    }
}

/// Look up the EFBScale for a resolution tier
pub fn lookup_scale(tier: &str) -> Option<u8> {
    RESOLUTION_SCALES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(tier.trim()))
        .map(|(_, scale)| *scale)
}

/// EFBScale for a tier, falling back to the lowest tier when unrecognized
pub fn scale_for_tier(tier: &str) -> u8 {
    let (lowest_name, lowest_scale) = RESOLUTION_SCALES[0];
    lookup_scale(tier).unwrap_or_else(|| {
        warn!(
            "Unknown resolution '{}', falling back to {} (EFBScale {})",
            tier, lowest_name, lowest_scale
        );
        lowest_scale
    })
}

/// Config file locations inside an emulator user directory
#[derive(Debug, Clone)]
pub struct IniPaths {
    pub dolphin_ini: PathBuf,
    pub gfx_ini: PathBuf,
    pub logger_ini: PathBuf,
    pub game_settings_ini: PathBuf,
}

impl IniPaths {
    pub fn new(user_dir: &Path) -> Self {
        let config_dir = user_dir.join("Config");
        Self {
            dolphin_ini: config_dir.join("Dolphin.ini"),
            gfx_ini: config_dir.join("GFX.ini"),
            logger_ini: config_dir.join("Logger.ini"),
            game_settings_ini: user_dir.join("GameSettings").join("GALE01.ini"),
        }
    }
}

/// Rewrites a workspace's emulator configuration for headless dumping.
/// Keys it doesn't set, comments and section order are left as they were.
#[derive(Debug, Clone)]
pub struct IniSettingsWriter {
    settings: RenderSettings,
}

impl IniSettingsWriter {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Apply all settings to the INI files under `user_dir`.
    /// Files are written one at a time with no rollback.
    pub fn apply(&self, user_dir: &Path) -> RenderResult<()> {
        let paths = IniPaths::new(user_dir);
        let scale = scale_for_tier(&self.settings.resolution);

        let mut gfx = IniDocument::load(&paths.gfx_ini)?;
        gfx.set("Settings", "LogRenderTimeToFile", "True");
        gfx.set("Settings", "EFBScale", scale.to_string());
        gfx.set("Settings", "BitrateKbps", self.settings.bitrate_kbps.to_string());
        gfx.set("Settings", "UseFFV1", "False");
        gfx.set("Settings", "ShowFPS", "False");
        gfx.set("Settings", "ShowNetPlayPing", "False");
        gfx.set("Settings", "ShowNetPlayMessages", "False");
        gfx.set("Settings", "InternalResolutionFrameDumps", "True");
        gfx.save(&paths.gfx_ini)?;

        let mut dolphin = IniDocument::load(&paths.dolphin_ini)?;
        dolphin.set("Movie", "DumpFrames", "True");
        dolphin.set("Movie", "DumpFramesSilent", "True");
        dolphin.set("DSP", "DumpAudio", "True");
        dolphin.set("DSP", "DumpAudioSilent", "True");
        dolphin.set("Display", "Fullscreen", "False");
        dolphin.set("Display", "RenderToMain", "True");
        dolphin.set("Interface", "ConfirmStop", "False");
        dolphin.set("Interface", "ShowToolbar", "False");
        dolphin.set("Interface", "ShowStatusbar", "False");
        dolphin.set("Interface", "ShowLogWindow", "False");
        dolphin.save(&paths.dolphin_ini)?;

        let mut logger = IniDocument::load(&paths.logger_ini)?;
        logger.set("Options", "WriteToConsole", "False");
        logger.set("Options", "WriteToWindow", "False");
        logger.save(&paths.logger_ini)?;

        if self.settings.widescreen {
            apply_widescreen(&paths.game_settings_ini)?;
        }

        debug!(
            "Applied emulator settings in {} (resolution {}, EFBScale {}, bitrate {} kbps, widescreen {})",
            user_dir.display(),
            self.settings.resolution,
            scale,
            self.settings.bitrate_kbps,
            self.settings.widescreen
        );
        Ok(())
    }
}

/// Enable the widescreen Gecko code, matching the naming the file already uses
fn apply_widescreen(game_ini: &Path) -> RenderResult<()> {
    let existing = match fs::read_to_string(game_ini) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(RenderError::io(game_ini, e)),
    };

    let code = widescreen_code_for(&existing);
    let mut doc = IniDocument::parse(&existing);
    doc.append_line(GECKO_ENABLED, code);
    doc.save(game_ini)?;

    info!("Enabled widescreen code '{}' in {}", code, game_ini.display());
    Ok(())
}

/// Pick the widescreen directive format based on markers already in the file
pub fn widescreen_code_for(game_ini_text: &str) -> &'static str {
    if game_ini_text.contains(WIDESCREEN_CODE) {
        WIDESCREEN_CODE
    } else {
        LEGACY_WIDESCREEN_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GFX_SAMPLE: &str = "\
; graphics settings
[Hardware]
VSync = False

[Settings]
AspectRatio = 0
EFBScale = 7
LogRenderTimeToFile = False

[Enhancements]
MaxAnisotropy = 0
";

    #[test]
    fn test_set_updates_existing_key_and_preserves_everything_else() {
        let mut doc = IniDocument::parse(GFX_SAMPLE);
        doc.set("Settings", "EFBScale", "5");

        assert_eq!(doc.get("Settings", "EFBScale"), Some("5"));
        assert_eq!(doc.get("Settings", "AspectRatio"), Some("0"));
        assert_eq!(doc.get("Hardware", "VSync"), Some("False"));
        let text = doc.to_string();
        assert!(text.starts_with("; graphics settings\n[Hardware]\n"));
        assert!(text.contains("[Enhancements]\nMaxAnisotropy = 0\n"));
    }

    #[test]
    fn test_set_inserts_new_key_inside_its_section() {
        let mut doc = IniDocument::parse(GFX_SAMPLE);
        doc.set("Settings", "BitrateKbps", "16000");

        let text = doc.to_string();
        let settings_at = text.find("[Settings]").unwrap();
        let bitrate_at = text.find("BitrateKbps = 16000").unwrap();
        let enhancements_at = text.find("[Enhancements]").unwrap();
        assert!(settings_at < bitrate_at && bitrate_at < enhancements_at, "{}", text);
        // The blank separator line stays before the next section
        assert!(text.contains("BitrateKbps = 16000\n\n[Enhancements]"), "{}", text);
    }

    #[test]
    fn test_set_creates_missing_section() {
        let mut doc = IniDocument::parse(GFX_SAMPLE);
        doc.set("Movie", "DumpFrames", "True");
        assert_eq!(doc.get("Movie", "DumpFrames"), Some("True"));
        assert!(doc.to_string().ends_with("\n[Movie]\nDumpFrames = True\n"));
    }

    #[test]
    fn test_empty_document_round_trip() {
        let mut doc = IniDocument::default();
        doc.set("Options", "WriteToConsole", "False");
        assert_eq!(doc.to_string(), "[Options]\nWriteToConsole = False\n");
    }

    #[test]
    fn test_each_resolution_tier_maps_to_its_scale() {
        assert_eq!(scale_for_tier("480p"), 2);
        assert_eq!(scale_for_tier("720p"), 3);
        assert_eq!(scale_for_tier("1080p"), 5);
        assert_eq!(scale_for_tier("1440p"), 6);
        assert_eq!(scale_for_tier("2160p"), 8);
    }

    #[test]
    fn test_unknown_resolution_falls_back_to_lowest_tier() {
        assert_eq!(lookup_scale("4320p"), None);
        assert_eq!(scale_for_tier("4320p"), 2);
        assert_eq!(scale_for_tier(""), 2);
        assert_eq!(scale_for_tier(" 1080P "), 5);
    }

    #[test]
    fn test_widescreen_format_detection() {
        let modern = "[Gecko]\n$Optional: Widescreen 16:9\n*Enables widescreen\n";
        let legacy = "[Gecko]\n$Widescreen 16:9\n";
        assert_eq!(widescreen_code_for(modern), WIDESCREEN_CODE);
        assert_eq!(widescreen_code_for(legacy), LEGACY_WIDESCREEN_CODE);
        assert_eq!(widescreen_code_for(""), LEGACY_WIDESCREEN_CODE);
    }

    #[test]
    fn test_apply_writes_dump_settings() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IniPaths::new(dir.path());
        fs::create_dir_all(paths.gfx_ini.parent().unwrap()).unwrap();
        fs::write(&paths.gfx_ini, GFX_SAMPLE).unwrap();

        let writer = IniSettingsWriter::new(RenderSettings {
            resolution: "1080p".to_string(),
            widescreen: false,
            bitrate_kbps: 25000,
        });
        writer.apply(dir.path()).unwrap();

        let gfx = IniDocument::load(&paths.gfx_ini).unwrap();
        assert_eq!(gfx.get("Settings", "LogRenderTimeToFile"), Some("True"));
        assert_eq!(gfx.get("Settings", "EFBScale"), Some("5"));
        assert_eq!(gfx.get("Settings", "BitrateKbps"), Some("25000"));
        assert_eq!(gfx.get("Hardware", "VSync"), Some("False"));

        let dolphin = IniDocument::load(&paths.dolphin_ini).unwrap();
        assert_eq!(dolphin.get("Movie", "DumpFrames"), Some("True"));
        assert_eq!(dolphin.get("DSP", "DumpAudio"), Some("True"));
        assert_eq!(dolphin.get("Interface", "ConfirmStop"), Some("False"));

        let logger = IniDocument::load(&paths.logger_ini).unwrap();
        assert_eq!(logger.get("Options", "WriteToWindow"), Some("False"));

        assert!(!paths.game_settings_ini.exists(), "widescreen was not requested");
    }

    #[test]
    fn test_apply_widescreen_keeps_existing_format() {
        let dir = tempfile::tempdir().unwrap();
        let paths = IniPaths::new(dir.path());
        fs::create_dir_all(paths.game_settings_ini.parent().unwrap()).unwrap();
        fs::write(
            &paths.game_settings_ini,
            "[Gecko]\n$Optional: Widescreen 16:9\n04000000 00000000\n",
        ).unwrap();

        let writer = IniSettingsWriter::new(RenderSettings {
            resolution: "480p".to_string(),
            widescreen: true,
            bitrate_kbps: 16000,
        });
        writer.apply(dir.path()).unwrap();
        // Applying twice must not duplicate the directive
        writer.apply(dir.path()).unwrap();

        let text = fs::read_to_string(&paths.game_settings_ini).unwrap();
        assert!(text.contains("[Gecko_Enabled]\n$Optional: Widescreen 16:9\n"), "{}", text);
        assert_eq!(text.matches("[Gecko_Enabled]").count(), 1);
        assert_eq!(text.matches("$Optional: Widescreen 16:9").count(), 2);
    }

    #[test]
    fn test_apply_widescreen_legacy_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = IniSettingsWriter::new(RenderSettings {
            resolution: "480p".to_string(),
            widescreen: true,
            bitrate_kbps: 16000,
        });
        writer.apply(dir.path()).unwrap();

        let text = fs::read_to_string(IniPaths::new(dir.path()).game_settings_ini).unwrap();
        assert_eq!(text, "[Gecko_Enabled]\n$Widescreen 16:9\n");
    }
}
