use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub keybindings: Keybindings,
    #[serde(default)]
    pub signatures: Signatures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout_secs: 15,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Signatures {
    pub new_message: Option<String>,
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Keybindings {
    pub next_panel: Vec<String>,
    pub prev_panel: Vec<String>,
    pub move_up: Vec<String>,
    pub move_down: Vec<String>,
    pub open: Vec<String>,
    pub mark_read: Vec<String>,
    pub archive: Vec<String>,
    pub delete: Vec<String>,
    pub new_message: Vec<String>,
    pub reply: Vec<String>,
    pub send_message: Vec<String>,
    pub refresh: Vec<String>,
    pub change_password: Vec<String>,
    pub logout: Vec<String>,
    pub quit: Vec<String>,
}

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|k| k.to_string()).collect()
}

impl Default for Keybindings {
    fn default() -> Self {
        Self {
            next_panel: keys(&["l", "Right", "Tab"]),
            prev_panel: keys(&["h", "Left", "BackTab"]),
            move_up: keys(&["k", "Up"]),
            move_down: keys(&["j", "Down"]),
            open: keys(&["Enter"]),
            mark_read: keys(&[" "]),
            archive: keys(&["a"]),
            delete: keys(&["Backspace", "d"]),
            new_message: keys(&["n"]),
            reply: keys(&["r"]),
            send_message: keys(&["ctrl-s"]),
            refresh: keys(&["R", "F5"]),
            change_password: keys(&["P"]),
            logout: keys(&["ctrl-l"]),
            quit: keys(&["q"]),
        }
    }
}

/// Parses a binding such as `"ctrl-s"`, `"F5"` or `"R"`. Unknown keys parse to
/// `KeyCode::Null`, which never matches.
pub fn parse_key_string(key_str: &str) -> (KeyCode, KeyModifiers) {
    let (chord, base) = match key_str.rsplit_once('-') {
        Some((chord, base)) if !base.is_empty() => (chord, base),
        // "-" on its own is the minus key
        _ => ("", key_str),
    };
    let modifiers = chord
        .split('-')
        .fold(KeyModifiers::empty(), |acc, name| acc | modifier(name));
    (key_code(base), modifiers)
}

fn modifier(name: &str) -> KeyModifiers {
    match name.to_ascii_lowercase().as_str() {
        "ctrl" | "control" => KeyModifiers::CONTROL,
        "alt" | "option" => KeyModifiers::ALT,
        "shift" => KeyModifiers::SHIFT,
        "cmd" | "command" | "super" => KeyModifiers::SUPER,
        "meta" => KeyModifiers::META,
        _ => KeyModifiers::empty(),
    }
}

fn key_code(name: &str) -> KeyCode {
    match name {
        "Enter" => KeyCode::Enter,
        "Esc" => KeyCode::Esc,
        "Tab" => KeyCode::Tab,
        "BackTab" => KeyCode::BackTab,
        "Backspace" => KeyCode::Backspace,
        "Delete" => KeyCode::Delete,
        "Up" => KeyCode::Up,
        "Down" => KeyCode::Down,
        "Left" => KeyCode::Left,
        "Right" => KeyCode::Right,
        _ => {
            if let Some(n) = name.strip_prefix('F').and_then(|n| n.parse::<u8>().ok()) {
                return KeyCode::F(n);
            }
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => KeyCode::Char(c),
                _ => KeyCode::Null,
            }
        }
    }
}

pub fn matches_key(event: KeyEvent, bindings: &[String]) -> bool {
    bindings.iter().map(|b| parse_key_string(b)).any(|(code, modifiers)| {
        code != KeyCode::Null && event.code == code && event.modifiers.contains(modifiers)
    })
}

impl Config {
    pub fn load() -> Self {
        match std::fs::read_to_string(SETTINGS_FILE) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {}", SETTINGS_FILE, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modifier_chords() {
        assert_eq!(
            parse_key_string("ctrl-s"),
            (KeyCode::Char('s'), KeyModifiers::CONTROL)
        );
        assert_eq!(parse_key_string("F5"), (KeyCode::F(5), KeyModifiers::empty()));
        assert_eq!(parse_key_string(" "), (KeyCode::Char(' '), KeyModifiers::empty()));
        assert_eq!(parse_key_string("-"), (KeyCode::Char('-'), KeyModifiers::empty()));
        assert_eq!(parse_key_string("Nonsense").0, KeyCode::Null);
    }

    #[test]
    fn matches_configured_binding() {
        let bindings = keys(&["ctrl-s"]);
        let pressed = KeyEvent::new(KeyCode::Char('s'), KeyModifiers::CONTROL);
        let plain = KeyEvent::new(KeyCode::Char('s'), KeyModifiers::empty());
        assert!(matches_key(pressed, &bindings));
        assert!(!matches_key(plain, &bindings));
    }

    #[test]
    fn partial_settings_keep_defaults() {
        let config = Config::parse(
            r#"
            [server]
            base_url = "https://mail.example.org"

            [keybindings]
            quit = ["x"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.base_url, "https://mail.example.org");
        assert_eq!(config.server.timeout_secs, 15);
        assert_eq!(config.keybindings.quit, vec!["x".to_string()]);
        assert_eq!(config.keybindings.archive, vec!["a".to_string()]);
        assert!(config.signatures.reply.is_none());
    }

    #[test]
    fn malformed_settings_are_an_error() {
        assert!(Config::parse("server = 5").is_err());
    }
}
