use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::{
    player::{PlayerIdentity, SteamId},
    voice::VoicePacket,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrackError {
    #[error("None of the requested players ({0}) has voice data in this demo")]
    NoMatchingPlayers(String),
    #[error("The demo contains no voice data")]
    NoVoiceData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerTrack {
    pub steam_id: SteamId,
    pub name: Option<String>,
    /// ordered by (section, sequence), then tick
    pub packets: Vec<VoicePacket>,
    pub gaps: usize,
    pub duplicates: usize,
}

impl PlayerTrack {
    fn new(steam_id: SteamId, name: Option<String>, mut packets: Vec<VoicePacket>) -> Self {
        packets.sort_by_key(|p| (p.section, p.sequence, p.tick));
        let before = packets.len();
        packets.dedup_by(|later, earlier| {
            later.section == earlier.section && later.sequence == earlier.sequence
        });
        let duplicates = before - packets.len();
        let gaps = packets
            .windows(2)
            .filter(|w| w[1].section == w[0].section && !w[1].continues(&w[0]))
            .count();
        Self {
            steam_id,
            name,
            packets,
            gaps,
            duplicates,
        }
    }

    pub fn first_tick(&self) -> Option<u32> {
        self.packets.iter().map(|p| p.tick).min()
    }

    pub fn last_tick(&self) -> Option<u32> {
        self.packets.iter().map(|p| p.tick).max()
    }
}

/// Buckets voice packets by player, dropping players outside the allow-list early.
#[derive(Debug, Default)]
pub struct TrackAssembler {
    allow_list: BTreeSet<SteamId>,
    buckets: BTreeMap<SteamId, Vec<VoicePacket>>,
    discarded: u64,
}

impl TrackAssembler {
    /// an empty allow-list keeps everyone
    pub fn new(allow_list: impl IntoIterator<Item = SteamId>) -> Self {
        Self {
            allow_list: allow_list.into_iter().collect(),
            ..Default::default()
        }
    }

    fn allowed(&self, steam_id: &SteamId) -> bool {
        self.allow_list.is_empty() || self.allow_list.contains(steam_id)
    }

    pub fn push(&mut self, packet: VoicePacket) {
        if !self.allowed(&packet.steam_id) {
            self.discarded += 1;
            return;
        }
        self.buckets.entry(packet.steam_id).or_default().push(packet);
    }

    /// packets dropped by the allow-list so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// `known` are all players the demo mentioned, listed players among them
    /// that never spoke still get a (silent) track. Without an allow-list only
    /// players that spoke get a track.
    pub fn finish(
        self,
        known: &BTreeMap<SteamId, PlayerIdentity>,
    ) -> Result<Vec<PlayerTrack>, TrackError> {
        if self.buckets.is_empty() {
            if self.allow_list.is_empty() {
                return Err(TrackError::NoVoiceData);
            }
            let ids: Vec<_> = self.allow_list.iter().map(SteamId::to_string).collect();
            return Err(TrackError::NoMatchingPlayers(ids.join(", ")));
        }
        let name_of = |id: &SteamId| known.get(id).map(|p| p.name.clone());
        let mut tracks: BTreeMap<SteamId, PlayerTrack> = self
            .buckets
            .into_iter()
            .map(|(id, packets)| (id, PlayerTrack::new(id, name_of(&id), packets)))
            .collect();
        for id in self.allow_list.iter().filter(|id| known.contains_key(id)) {
            tracks
                .entry(*id)
                .or_insert_with(|| PlayerTrack::new(*id, name_of(id), Vec::new()));
        }
        Ok(tracks.into_values().collect())
    }
}
