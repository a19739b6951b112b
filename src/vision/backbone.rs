use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Vision backbones whose embedding spaces are searched independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    #[serde(alias = "conv")]
    ConvNext,
    Vit,
}

impl Backbone {
    pub const ALL: [Backbone; 2] = [Backbone::ConvNext, Backbone::Vit];

    pub fn as_str(self) -> &'static str {
        match self {
            Backbone::ConvNext => "convnext",
            Backbone::Vit => "vit",
        }
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backbone {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "convnext" | "conv" => Ok(Backbone::ConvNext),
            "vit" => Ok(Backbone::Vit),
            other => anyhow::bail!("Unknown backbone: {other}"),
        }
    }
}
