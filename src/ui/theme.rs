use owo_colors::Style;
use std::sync::OnceLock;

static THEME: OnceLock<Theme> = OnceLock::new();

/// Styles for CLI output. Colors are off when stdout isn't a terminal or
/// `NO_COLOR` / `CLICOLOR=0` is set.
#[derive(Debug, Clone)]
pub struct Theme {
    pub title: Style,
    pub ok: Style,
    pub failure: Style,
    pub caution: Style,
    pub uid: Style,
    pub cursor: Style,
    pub label: Style,
}

impl Theme {
    pub fn detect() -> Self {
        if console::Term::stdout().is_term() && console::colors_enabled() {
            Self::colored()
        } else {
            Self::plain()
        }
    }

    pub fn colored() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            ok: Style::new().green().bold(),
            failure: Style::new().red().bold(),
            caution: Style::new().yellow(),
            uid: Style::new().magenta(),
            cursor: Style::new().blue(),
            label: Style::new().bright_black(),
        }
    }

    pub fn plain() -> Self {
        let none = Style::new();
        Self {
            title: none,
            ok: none,
            failure: none,
            caution: none,
            uid: none,
            cursor: none,
            label: none,
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}
