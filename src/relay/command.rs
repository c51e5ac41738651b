//! Chat command parsing.

/// One inbound chat message, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Stop,
    Allow,
    Deny,
    Escape,
    Status,
    Sessions,
    Screen,
    Plan,
    Help,
    /// `/switch <name>`; `None` when the name is missing.
    Switch(Option<String>),
    /// `/rename <name>`; `None` when the name is missing.
    Rename(Option<String>),
    /// `/<n>`: pick entry `n` of the visible menu.
    SelectOption(u32),
    /// Anything else is typed into the session.
    Input(String),
}

impl ChatCommand {
    /// Classify `text`.
    ///
    /// Commands may carry a bot-name suffix (`/stop@my_bot`). Commands that
    /// take no argument only match when nothing follows them; `/stop now` is
    /// ordinary input.
    pub fn parse(text: &str) -> Self {
        let input = || Self::Input(text.to_string());

        let Some(body) = text.strip_prefix('/') else {
            return input();
        };
        let mut words = body.split_whitespace();
        let Some(head) = words.next() else {
            return input();
        };
        let name = head.split_once('@').map_or(head, |(name, _)| name);
        let argument = words.next().map(str::to_string);
        let bare = argument.is_none();

        match name {
            "switch" => Self::Switch(argument),
            "rename" => Self::Rename(argument),
            _ if !bare => input(),
            "stop" => Self::Stop,
            "allow" => Self::Allow,
            "deny" => Self::Deny,
            "escape" => Self::Escape,
            "status" => Self::Status,
            "sessions" => Self::Sessions,
            "screen" => Self::Screen,
            "plan" => Self::Plan,
            "help" | "start" => Self::Help,
            digits if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                match digits.parse::<u32>() {
                    Ok(n) if n >= 1 => Self::SelectOption(n),
                    _ => input(),
                }
            }
            _ => input(),
        }
    }
}
