//! Built-in bot scripts used for practice opponents and headless matches

use std::fmt;
use std::str::FromStr;

/// Bundled bot behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BotProfile {
    Standard,
    Aggressive,
    Defensive,
    Erratic,
    Stationary,
    Sniper,
}

impl BotProfile {
    pub const ALL: [BotProfile; 6] = [
        BotProfile::Standard,
        BotProfile::Aggressive,
        BotProfile::Defensive,
        BotProfile::Erratic,
        BotProfile::Stationary,
        BotProfile::Sniper,
    ];

    /// Resolve a profile by name, unknown names get the standard bot
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or(BotProfile::Standard)
    }

    pub fn name(self) -> &'static str {
        match self {
            BotProfile::Standard => "standard",
            BotProfile::Aggressive => "aggressive",
            BotProfile::Defensive => "defensive",
            BotProfile::Erratic => "erratic",
            BotProfile::Stationary => "stationary",
            BotProfile::Sniper => "sniper",
        }
    }

    /// Display name given to the robot in a match
    pub fn display_name(self) -> String {
        let name = self.name();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => format!("{}{} Bot", first.to_ascii_uppercase(), chars.as_str()),
            None => String::new(),
        }
    }

    pub fn source(self) -> &'static str {
        match self {
            BotProfile::Standard => include_str!("bots/standard.rhai"),
            BotProfile::Aggressive => include_str!("bots/aggressive.rhai"),
            BotProfile::Defensive => include_str!("bots/defensive.rhai"),
            BotProfile::Erratic => include_str!("bots/erratic.rhai"),
            BotProfile::Stationary => include_str!("bots/stationary.rhai"),
            BotProfile::Sniper => include_str!("bots/sniper.rhai"),
        }
    }
}

impl FromStr for BotProfile {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BotProfile::ALL
            .into_iter()
            .find(|profile| profile.name() == wanted)
            .ok_or(())
    }
}

impl fmt::Display for BotProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
