use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// An absolute count or a percentage of a total, e.g. `1` or `"25%"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    String(String),
}

impl IntOrPercent {
    pub fn percent(value: i32) -> Self {
        IntOrPercent::String(format!("{}%", value))
    }

    /// Resolve against `total`. Percentages round up when `round_up` is set,
    /// down otherwise. Plain integer strings are accepted as counts.
    pub fn scaled_value(&self, total: i32, round_up: bool) -> Result<i32> {
        match self {
            IntOrPercent::Int(v) => Ok(*v),
            IntOrPercent::String(s) => {
                let Some(pct) = s.strip_suffix('%') else {
                    return match s.parse::<i32>() {
                        Ok(v) => Ok(v),
                        Err(_) => bail!("invalid value '{}': must be an integer or percentage", s),
                    };
                };
                let pct: i64 = match pct.parse() {
                    Ok(p) => p,
                    Err(_) => bail!("invalid percentage '{}'", s),
                };
                let scaled = match pct.checked_mul(i64::from(total)) {
                    Some(v) if round_up => v.checked_add(99),
                    other => other,
                };
                let Some(scaled) = scaled else {
                    bail!("percentage '{}' of {} is out of range", s, total);
                };
                match i32::try_from(scaled.div_euclid(100)) {
                    Ok(v) => Ok(v),
                    Err(_) => bail!("percentage '{}' of {} is out of range", s, total),
                }
            }
        }
    }
}

impl Default for IntOrPercent {
    fn default() -> Self {
        IntOrPercent::Int(0)
    }
}

impl std::fmt::Display for IntOrPercent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntOrPercent::Int(v) => write!(f, "{}", v),
            IntOrPercent::String(s) => write!(f, "{}", s),
        }
    }
}
