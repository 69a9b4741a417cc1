use serde::{Deserialize, Serialize};

/// Why a flag resolved the way it did (OFREP `reason`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// Deployed stage without criteria, or a simple feature.
    Static,
    /// No criterion applied to the context.
    Default,
    /// A full (100%) criterion applied.
    TargetingMatch,
    /// A partial rollout criterion applied.
    Split,
    /// Feature disabled, stage not deployed, or a dependency is off.
    Disabled,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    On,
    Off,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        if value {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// The outcome of resolving one flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub variant: Variant,
    pub reason: Reason,
}

impl Resolution {
    pub fn new(value: bool, reason: Reason) -> Self {
        Self {
            variant: value.into(),
            reason,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Reason::Disabled)
    }

    pub fn value(&self) -> bool {
        self.variant == Variant::On
    }
}
