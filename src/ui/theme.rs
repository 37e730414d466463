use crate::infra::{ThemeConfig, parse_hex_color};
use ratatui::style::{Color, Modifier, Style};
use std::sync::Arc;
use tracing::warn;

pub const DEFAULT_THEME: &str = "default";

// Keep every UI color behind a role here instead of sprinkling literals through the views.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Palette {
    pub bg: Color,
    pub surface: Color,
    pub bar_bg: Color,
    pub fg: Color,
    pub muted: Color,
    pub dim: Color,
    pub border: Color,
    pub accent: Color,
    pub accent_bg: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
    pub user: Color,
    pub assistant: Color,
    pub tool: Color,
}

const fn rgb(r: u8, g: u8, b: u8) -> Color {
    Color::Rgb(r, g, b)
}

const DEFAULT: Palette = Palette {
    bg: rgb(11, 13, 16),
    surface: rgb(17, 21, 27),
    bar_bg: rgb(14, 18, 24),
    fg: rgb(229, 231, 235),
    muted: rgb(156, 163, 175),
    dim: rgb(107, 114, 128),
    border: rgb(55, 65, 81),
    accent: rgb(255, 159, 26),
    accent_bg: rgb(44, 32, 16),
    success: rgb(134, 239, 172),
    warning: rgb(250, 204, 21),
    error: rgb(248, 113, 113),
    user: rgb(125, 211, 252),
    assistant: rgb(229, 231, 235),
    tool: rgb(196, 181, 253),
};

const DRACULA: Palette = Palette {
    bg: rgb(40, 42, 54),
    surface: rgb(48, 50, 64),
    bar_bg: rgb(33, 34, 44),
    fg: rgb(248, 248, 242),
    muted: rgb(189, 147, 249),
    dim: rgb(98, 114, 164),
    border: rgb(68, 71, 90),
    accent: rgb(255, 121, 198),
    accent_bg: rgb(68, 71, 90),
    success: rgb(80, 250, 123),
    warning: rgb(241, 250, 140),
    error: rgb(255, 85, 85),
    user: rgb(139, 233, 253),
    assistant: rgb(248, 248, 242),
    tool: rgb(255, 184, 108),
};

const LIGHT: Palette = Palette {
    bg: rgb(250, 250, 250),
    surface: rgb(240, 241, 243),
    bar_bg: rgb(229, 231, 235),
    fg: rgb(17, 24, 39),
    muted: rgb(75, 85, 99),
    dim: rgb(156, 163, 175),
    border: rgb(209, 213, 219),
    accent: rgb(217, 119, 6),
    accent_bg: rgb(254, 243, 199),
    success: rgb(22, 163, 74),
    warning: rgb(202, 138, 4),
    error: rgb(220, 38, 38),
    user: rgb(2, 132, 199),
    assistant: rgb(17, 24, 39),
    tool: rgb(124, 58, 237),
};

const CATPPUCCIN: Palette = Palette {
    bg: rgb(30, 30, 46),
    surface: rgb(49, 50, 68),
    bar_bg: rgb(24, 24, 37),
    fg: rgb(205, 214, 244),
    muted: rgb(166, 173, 200),
    dim: rgb(108, 112, 134),
    border: rgb(69, 71, 90),
    accent: rgb(203, 166, 247),
    accent_bg: rgb(69, 71, 90),
    success: rgb(166, 227, 161),
    warning: rgb(249, 226, 175),
    error: rgb(243, 139, 168),
    user: rgb(137, 180, 250),
    assistant: rgb(205, 214, 244),
    tool: rgb(250, 179, 135),
};

const NORD: Palette = Palette {
    bg: rgb(46, 52, 64),
    surface: rgb(59, 66, 82),
    bar_bg: rgb(41, 46, 57),
    fg: rgb(236, 239, 244),
    muted: rgb(216, 222, 233),
    dim: rgb(76, 86, 106),
    border: rgb(67, 76, 94),
    accent: rgb(136, 192, 208),
    accent_bg: rgb(67, 76, 94),
    success: rgb(163, 190, 140),
    warning: rgb(235, 203, 139),
    error: rgb(191, 97, 106),
    user: rgb(129, 161, 193),
    assistant: rgb(236, 239, 244),
    tool: rgb(180, 142, 173),
};

const GRUVBOX: Palette = Palette {
    bg: rgb(40, 40, 40),
    surface: rgb(60, 56, 54),
    bar_bg: rgb(29, 32, 33),
    fg: rgb(235, 219, 178),
    muted: rgb(189, 174, 147),
    dim: rgb(146, 131, 116),
    border: rgb(80, 73, 69),
    accent: rgb(254, 128, 25),
    accent_bg: rgb(80, 73, 69),
    success: rgb(184, 187, 38),
    warning: rgb(250, 189, 47),
    error: rgb(251, 73, 52),
    user: rgb(131, 165, 152),
    assistant: rgb(235, 219, 178),
    tool: rgb(211, 134, 155),
};

const BUILTIN: [(&str, Palette); 3] = [("default", DEFAULT), ("dracula", DRACULA), ("light", LIGHT)];

const COMMUNITY: [(&str, Palette); 3] = [
    ("catppuccin", CATPPUCCIN),
    ("nord", NORD),
    ("gruvbox", GRUVBOX),
];

/// Every selectable name: built-ins first, then community palettes.
pub fn theme_names() -> Vec<String> {
    BUILTIN
        .iter()
        .chain(COMMUNITY.iter())
        .map(|(name, _)| (*name).to_string())
        .collect()
}

pub fn is_community(name: &str) -> bool {
    COMMUNITY.iter().any(|(candidate, _)| *candidate == name)
}

fn lookup(table: &[(&str, Palette)], name: &str) -> Option<Palette> {
    table
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
        .map(|(_, palette)| *palette)
}

/// A community palette wins over the named base; overrides apply last.
pub fn resolve_palette(theme: &ThemeConfig) -> Palette {
    let mut palette = theme
        .community
        .as_deref()
        .and_then(|name| lookup(&COMMUNITY, name))
        .or_else(|| lookup(&BUILTIN, &theme.name))
        .or_else(|| lookup(&COMMUNITY, &theme.name))
        .unwrap_or(DEFAULT);

    for (role, hex) in &theme.overrides {
        let Some((r, g, b)) = parse_hex_color(hex) else {
            warn!(role, hex, "ignoring theme override with invalid color");
            continue;
        };
        if !palette.set(role, Color::Rgb(r, g, b)) {
            warn!(role, "ignoring theme override for unknown role");
        }
    }
    palette
}

impl Palette {
    fn set(&mut self, role: &str, color: Color) -> bool {
        let slot = match role {
            "bg" | "background" => &mut self.bg,
            "surface" => &mut self.surface,
            "barBg" | "bar_bg" => &mut self.bar_bg,
            "fg" | "text" => &mut self.fg,
            "muted" => &mut self.muted,
            "dim" => &mut self.dim,
            "border" => &mut self.border,
            "accent" | "primary" => &mut self.accent,
            "accentBg" | "accent_bg" => &mut self.accent_bg,
            "success" => &mut self.success,
            "warning" => &mut self.warning,
            "error" => &mut self.error,
            "user" => &mut self.user,
            "assistant" => &mut self.assistant,
            "tool" => &mut self.tool,
            _ => return false,
        };
        *slot = color;
        true
    }
}

/// Ready-made styles for one theme. Built once per theme change and shared through an `Arc`.
#[derive(Clone, Debug, PartialEq)]
pub struct Styles {
    pub name: String,
    pub palette: Palette,
    pub base: Style,
    pub bar: Style,
    pub text: Style,
    pub muted: Style,
    pub dim: Style,
    pub border: Style,
    pub border_focused: Style,
    pub title: Style,
    pub selected: Style,
    pub tab_active: Style,
    pub tab_inactive: Style,
    pub key_hint: Style,
    pub toast_info: Style,
    pub toast_warning: Style,
    pub toast_error: Style,
    pub error: Style,
    pub success: Style,
    pub user: Style,
    pub assistant: Style,
    pub tool: Style,
    pub thinking: Style,
    pub highlight: Style,
}

impl Styles {
    pub fn from_palette(name: &str, p: Palette) -> Self {
        let base = Style::default().fg(p.fg).bg(p.bg);
        Self {
            name: name.to_string(),
            palette: p,
            base,
            bar: Style::default().fg(p.muted).bg(p.bar_bg),
            text: Style::default().fg(p.fg),
            muted: Style::default().fg(p.muted),
            dim: Style::default().fg(p.dim),
            border: Style::default().fg(p.border),
            border_focused: Style::default().fg(p.accent),
            title: Style::default().fg(p.fg).add_modifier(Modifier::BOLD),
            selected: Style::default().fg(p.accent).bg(p.accent_bg).add_modifier(Modifier::BOLD),
            tab_active: Style::default().fg(p.bg).bg(p.accent).add_modifier(Modifier::BOLD),
            tab_inactive: Style::default().fg(p.muted).bg(p.bar_bg),
            key_hint: Style::default().fg(p.accent),
            toast_info: Style::default().fg(p.success).bg(p.bar_bg),
            toast_warning: Style::default().fg(p.warning).bg(p.bar_bg),
            toast_error: Style::default().fg(p.error).bg(p.bar_bg),
            error: Style::default().fg(p.error),
            success: Style::default().fg(p.success),
            user: Style::default().fg(p.user).add_modifier(Modifier::BOLD),
            assistant: Style::default().fg(p.assistant),
            tool: Style::default().fg(p.tool),
            thinking: Style::default().fg(p.dim).add_modifier(Modifier::ITALIC),
            highlight: Style::default().fg(p.bg).bg(p.warning),
        }
    }

    pub fn for_theme(theme: &ThemeConfig) -> Arc<Self> {
        Arc::new(Self::from_palette(theme.display_name(), resolve_palette(theme)))
    }
}

impl Default for Styles {
    fn default() -> Self {
        Self::from_palette(DEFAULT_THEME, DEFAULT)
    }
}
