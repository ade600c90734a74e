use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::MutauError;

/// Physics object types which can appear as NanoAOD trigger objects (`TrigObj.id`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticleKind {
    /// Jet (id 1).
    Jet,
    /// Missing transverse energy (id 2).
    Met,
    /// Scalar sum of jet momenta (id 3).
    Ht,
    /// Missing HT (id 4).
    Mht,
    /// Large-radius jet (id 6).
    FatJet,
    /// Electron (id 11).
    Electron,
    /// Muon (id 13).
    Muon,
    /// Hadronic tau (id 15).
    Tau,
    /// Photon (id 22).
    Photon,
}

impl ParticleKind {
    /// The code stored in `TrigObj.id` for this kind of object.
    pub fn pdg_id(&self) -> i64 {
        match self {
            ParticleKind::Jet => 1,
            ParticleKind::Met => 2,
            ParticleKind::Ht => 3,
            ParticleKind::Mht => 4,
            ParticleKind::FatJet => 6,
            ParticleKind::Electron => 11,
            ParticleKind::Muon => 13,
            ParticleKind::Tau => 15,
            ParticleKind::Photon => 22,
        }
    }

    /// Look up the object kind for a (sign-insensitive) trigger object code.
    pub fn from_pdg_id(pdg_id: i64) -> Option<Self> {
        match pdg_id.abs() {
            1 => Some(ParticleKind::Jet),
            2 => Some(ParticleKind::Met),
            3 => Some(ParticleKind::Ht),
            4 => Some(ParticleKind::Mht),
            6 => Some(ParticleKind::FatJet),
            11 => Some(ParticleKind::Electron),
            13 => Some(ParticleKind::Muon),
            15 => Some(ParticleKind::Tau),
            22 => Some(ParticleKind::Photon),
            _ => None,
        }
    }
}

impl Display for ParticleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticleKind::Jet => write!(f, "Jet"),
            ParticleKind::Met => write!(f, "MET"),
            ParticleKind::Ht => write!(f, "HT"),
            ParticleKind::Mht => write!(f, "MHT"),
            ParticleKind::FatJet => write!(f, "FatJet"),
            ParticleKind::Electron => write!(f, "Electron"),
            ParticleKind::Muon => write!(f, "Muon"),
            ParticleKind::Tau => write!(f, "Tau"),
            ParticleKind::Photon => write!(f, "Photon"),
        }
    }
}

impl FromStr for ParticleKind {
    type Err = MutauError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jet" | "j" => Ok(Self::Jet),
            "met" => Ok(Self::Met),
            "ht" => Ok(Self::Ht),
            "mht" => Ok(Self::Mht),
            "fatjet" | "fat jet" => Ok(Self::FatJet),
            "electron" | "e" => Ok(Self::Electron),
            "muon" | "mu" => Ok(Self::Muon),
            "tau" => Ok(Self::Tau),
            "photon" | "gamma" => Ok(Self::Photon),
            _ => Err(MutauError::ParseError {
                name: s.to_string(),
                object: "ParticleKind".to_string(),
            }),
        }
    }
}

/// Binary comparison operators used by object cuts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    /// `value > threshold`
    Greater,
    /// `value >= threshold`
    GreaterEq,
    /// `value < threshold`
    Less,
    /// `value <= threshold`
    LessEq,
    /// `value == threshold`
    Equal,
    /// `value != threshold`
    NotEqual,
}

impl Comparison {
    /// Apply the comparison.
    #[inline]
    pub fn compare<T: PartialOrd>(&self, value: T, threshold: T) -> bool {
        match self {
            Comparison::Greater => value > threshold,
            Comparison::GreaterEq => value >= threshold,
            Comparison::Less => value < threshold,
            Comparison::LessEq => value <= threshold,
            Comparison::Equal => value == threshold,
            Comparison::NotEqual => value != threshold,
        }
    }
}

impl Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparison::Greater => write!(f, ">"),
            Comparison::GreaterEq => write!(f, ">="),
            Comparison::Less => write!(f, "<"),
            Comparison::LessEq => write!(f, "<="),
            Comparison::Equal => write!(f, "=="),
            Comparison::NotEqual => write!(f, "!="),
        }
    }
}

impl FromStr for Comparison {
    type Err = MutauError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ">" | "gt" => Ok(Self::Greater),
            ">=" | "ge" => Ok(Self::GreaterEq),
            "<" | "lt" => Ok(Self::Less),
            "<=" | "le" => Ok(Self::LessEq),
            "==" | "eq" => Ok(Self::Equal),
            "!=" | "ne" => Ok(Self::NotEqual),
            _ => Err(MutauError::ParseError {
                name: s.to_string(),
                object: "Comparison".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_displays() {
        assert_eq!(format!("{}", ParticleKind::Muon), "Muon");
        assert_eq!(format!("{}", ParticleKind::Met), "MET");
        assert_eq!(format!("{}", Comparison::GreaterEq), ">=");
        assert_eq!(format!("{}", Comparison::NotEqual), "!=");
    }

    #[test]
    fn particle_codes() {
        assert_eq!(ParticleKind::from_pdg_id(-13), Some(ParticleKind::Muon));
        assert_eq!(ParticleKind::from_pdg_id(15), Some(ParticleKind::Tau));
        assert_eq!(ParticleKind::from_pdg_id(5), None);
        assert_eq!(ParticleKind::Tau.pdg_id(), 15);
        assert_eq!("mu".parse::<ParticleKind>().unwrap(), ParticleKind::Muon);
        assert!("quark".parse::<ParticleKind>().is_err());
    }

    #[test]
    fn comparisons() {
        assert!(Comparison::Greater.compare(26.1, 26.0));
        assert!(!Comparison::Greater.compare(26.0, 26.0));
        assert!(Comparison::GreaterEq.compare(5, 5));
        assert!(Comparison::NotEqual.compare(6, 5));
        assert_eq!("<".parse::<Comparison>().unwrap(), Comparison::Less);
    }
}
