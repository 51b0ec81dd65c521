/// Parser for the output of the `mcuboot` shell command.
///
/// ```text
/// swap type: none
/// confirmed: 1
///
/// primary area (1):
///   version: 0.0.2+0
///   image size: 68240
///   magic: good
///   swap type: test
///   copy done: set
///   image ok: unset
///
/// failed to read secondary area (2) header: -5
/// ```
use once_cell::sync::Lazy;
use regex::Regex;

static AREA: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(.+ area.*):\s*$").expect("area pattern"));
static KEY_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?P<key>[^:]+):(?P<val>.+)$").expect("key pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McubootArea {
    pub name: String,
    pub version: String,
    pub image_size: String,
    pub magic: String,
    pub swap_type: String,
    pub copy_done: String,
    pub image_ok: String,
}

impl McubootArea {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: String::new(),
            image_size: String::new(),
            magic: "unset".to_string(),
            swap_type: "none".to_string(),
            copy_done: "unset".to_string(),
            image_ok: "unset".to_string(),
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        let value = value.to_string();
        match key {
            "version" => self.version = value,
            "image size" => self.image_size = value,
            "magic" => self.magic = value,
            "swap type" => self.swap_type = value,
            "copy done" => self.copy_done = value,
            "image ok" => self.image_ok = value,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McubootStatus {
    /// Swap type reported before the area list.
    pub swap_type: Option<String>,
    pub confirmed: Option<String>,
    pub areas: Vec<McubootArea>,
}

impl McubootStatus {
    pub fn area(&self, prefix: &str) -> Option<&McubootArea> {
        self.areas.iter().find(|area| area.name.starts_with(prefix))
    }

    pub fn primary(&self) -> Option<&McubootArea> {
        self.area("primary")
    }

    pub fn secondary(&self) -> Option<&McubootArea> {
        self.area("secondary")
    }
}

pub fn parse_mcuboot_output<S: AsRef<str>>(lines: &[S]) -> McubootStatus {
    let mut status = McubootStatus::default();
    let mut current: Option<McubootArea> = None;

    for line in lines.iter().map(AsRef::as_ref) {
        if line.trim_start().starts_with("failed to read") {
            // The area is not listed; anything after belongs to no area.
            status.areas.extend(current.take());
            continue;
        }
        if let Some(caps) = AREA.captures(line) {
            status.areas.extend(current.take());
            current = Some(McubootArea::new(caps[1].trim()));
            continue;
        }
        let Some(caps) = KEY_VALUE.captures(line) else {
            continue;
        };
        let key = caps["key"].trim();
        let value = caps["val"].trim();
        match current.as_mut() {
            Some(area) => area.set(key, value),
            None => match key {
                "swap type" => status.swap_type = Some(value.to_string()),
                "confirmed" => status.confirmed = Some(value.to_string()),
                _ => {}
            },
        }
    }
    status.areas.extend(current);
    status
}
