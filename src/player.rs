use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use thiserror::Error;

use crate::structs::PlayerInfo;

/// 64 bit Steam account id, the stable key for attributing voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SteamId(pub u64);

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid SteamID64 {0:?}, expected 17 digits starting with 7656")]
pub struct InvalidSteamId(pub String);

impl FromStr for SteamId {
    type Err = InvalidSteamId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid =
            s.len() == 17 && s.starts_with("7656") && s.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(InvalidSteamId(s.to_string()));
        }
        s.parse()
            .map(SteamId)
            .map_err(|_| InvalidSteamId(s.to_string()))
    }
}

impl fmt::Display for SteamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub steam_id: SteamId,
    pub name: String,
    pub slot: u32,
}

impl PlayerIdentity {
    /// bots and HLTV have no account and never own voice
    pub fn from_info(slot: u32, info: &PlayerInfo) -> Option<Self> {
        if info.fakeplayer || info.ishltv {
            return None;
        }
        let id = if info.steamid != 0 {
            info.steamid
        } else {
            info.xuid
        };
        if id == 0 {
            return None;
        }
        Some(Self {
            steam_id: SteamId(id),
            name: String::from_utf8_lossy(&info.name).into_owned(),
            slot,
        })
    }
}

/// slot -> identity, cumulative over the frames seen so far
#[derive(Debug, Default)]
pub struct PlayerTable {
    slots: HashMap<u32, PlayerIdentity>,
    // everyone that was ever in the table, with the latest known name
    seen: BTreeMap<SteamId, PlayerIdentity>,
}

impl PlayerTable {
    pub fn resolve(&self, slot: u32) -> Option<&PlayerIdentity> {
        self.slots.get(&slot)
    }

    pub fn set(&mut self, slot: u32, identity: Option<PlayerIdentity>) {
        match identity {
            Some(identity) => {
                self.seen.insert(identity.steam_id, identity.clone());
                self.slots.insert(slot, identity);
            }
            None => {
                self.slots.remove(&slot);
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn known_players(&self) -> &BTreeMap<SteamId, PlayerIdentity> {
        &self.seen
    }
}

#[cfg(test)]
mod test {
    use super::{PlayerIdentity, PlayerTable, SteamId};
    use crate::structs::PlayerInfo;

    #[test]
    pub fn parses_steam_ids() {
        assert_eq!(
            "76561198012345678".parse::<SteamId>(),
            Ok(SteamId(76561198012345678))
        );
        for bad in [
            "",
            "7656119801234567",
            "765611980123456789",
            "86561198012345678",
            "7656119801234567a",
            " 76561198012345678",
        ] {
            assert!(bad.parse::<SteamId>().is_err(), "{bad:?} accepted");
        }
        assert_eq!(SteamId(76561198012345678).to_string(), "76561198012345678");
    }

    #[test]
    pub fn slot_reuse_keeps_history() {
        let mut table = PlayerTable::default();
        let a = PlayerIdentity {
            steam_id: SteamId(76561198000000001),
            name: "a".into(),
            slot: 2,
        };
        let b = PlayerIdentity {
            steam_id: SteamId(76561198000000002),
            name: "b".into(),
            slot: 2,
        };
        table.set(2, Some(a.clone()));
        assert_eq!(table.resolve(2), Some(&a));
        table.set(2, None);
        assert_eq!(table.resolve(2), None);
        table.set(2, Some(b.clone()));
        assert_eq!(table.resolve(2), Some(&b));
        assert_eq!(table.len(), 1);
        assert_eq!(table.known_players().len(), 2);
    }

    #[test]
    pub fn bots_have_no_identity() {
        let bot = PlayerInfo {
            name: b"BOT Kugel".to_vec(),
            fakeplayer: true,
            ..Default::default()
        };
        assert_eq!(PlayerIdentity::from_info(3, &bot), None);
        let human = PlayerInfo {
            name: b"someone".to_vec(),
            xuid: 76561198000000003,
            ..Default::default()
        };
        let id = PlayerIdentity::from_info(3, &human).unwrap();
        assert_eq!(id.steam_id, SteamId(76561198000000003));
        assert_eq!(id.slot, 3);
    }
}
