//! The four chain kinds of a project.

use std::path::{Path, PathBuf};

/// One of a project's four append-only chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChainKind {
    /// Shared project transactions
    Public,
    /// Sensitive half of paired project transactions
    Private,
    /// Shared host-level transactions
    PublicHost,
    /// Sensitive half of paired host-level transactions
    PrivateHost,
}

impl ChainKind {
    /// All chains, in replay order.
    pub const ALL: [Self; 4] = [Self::Public, Self::Private, Self::PublicHost, Self::PrivateHost];

    /// Public chain a private chain pairs with.
    pub fn base(self) -> Option<Self> {
        match self {
            Self::Private => Some(Self::Public),
            Self::PrivateHost => Some(Self::PublicHost),
            Self::Public | Self::PublicHost => None,
        }
    }

    /// True for `Private` and `PrivateHost`.
    pub fn is_private(self) -> bool {
        self.base().is_some()
    }

    /// Suffix appended to the project name.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::PublicHost => "publichost",
            Self::PrivateHost => "privatehost",
        }
    }

    /// File name, `<project><suffix>.lbc`.
    pub fn file_name(self, project: &str) -> String {
        format!("{project}{}.lbc", self.suffix())
    }

    /// Full path under `dir`.
    pub fn path(self, dir: &Path, project: &str) -> PathBuf {
        dir.join(self.file_name(project))
    }

    /// Index into per-chain arrays.
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Wire tag used when chains are named in messages.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Chain for a wire tag.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Self::ALL.get(usize::from(raw)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names() {
        let names: Vec<String> = ChainKind::ALL.iter().map(|k| k.file_name("acme")).collect();
        assert_eq!(names, ["acmepublic.lbc", "acmeprivate.lbc", "acmepublichost.lbc", "acmeprivatehost.lbc"]);
    }

    #[test]
    fn private_chains_pair_with_public() {
        assert_eq!(ChainKind::Private.base(), Some(ChainKind::Public));
        assert_eq!(ChainKind::PrivateHost.base(), Some(ChainKind::PublicHost));
        assert!(!ChainKind::PublicHost.is_private());
    }

    #[test]
    fn wire_tags() {
        for kind in ChainKind::ALL {
            assert_eq!(ChainKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(ChainKind::from_u8(4), None);
    }
}
