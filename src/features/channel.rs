//! Feature channels: the detector/descriptor families processed side by side.

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// A detector/descriptor family.
///
/// Every frame carries one independent set of features per channel, and a
/// landmark belongs to exactly one channel for its whole lifetime. Matching
/// never crosses channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Orb,
    Brisk,
    Akaze,
}

impl FeatureType {
    pub const COUNT: usize = 3;
    pub const ALL: [FeatureType; FeatureType::COUNT] =
        [FeatureType::Orb, FeatureType::Brisk, FeatureType::Akaze];

    /// Dense index used by [`ChannelSet`].
    pub fn index(self) -> usize {
        match self {
            FeatureType::Orb => 0,
            FeatureType::Brisk => 1,
            FeatureType::Akaze => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FeatureType::Orb => "orb",
            FeatureType::Brisk => "brisk",
            FeatureType::Akaze => "akaze",
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per feature channel, indexed by [`FeatureType`].
#[derive(Debug, Clone, Default)]
pub struct ChannelSet<T> {
    slots: [T; FeatureType::COUNT],
}

impl<T> ChannelSet<T> {
    /// Build a set by evaluating `f` once per channel.
    pub fn from_fn(mut f: impl FnMut(FeatureType) -> T) -> Self {
        Self {
            slots: std::array::from_fn(|i| f(FeatureType::ALL[i])),
        }
    }

    pub fn get(&self, channel: FeatureType) -> &T {
        &self.slots[channel.index()]
    }

    pub fn get_mut(&mut self, channel: FeatureType) -> &mut T {
        &mut self.slots[channel.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureType, &T)> {
        FeatureType::ALL.into_iter().zip(self.slots.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (FeatureType, &mut T)> {
        FeatureType::ALL.into_iter().zip(self.slots.iter_mut())
    }

    /// Transform every channel's value.
    pub fn map<U>(self, mut f: impl FnMut(FeatureType, T) -> U) -> ChannelSet<U> {
        let mut i = 0;
        ChannelSet {
            slots: self.slots.map(|value| {
                let channel = FeatureType::ALL[i];
                i += 1;
                f(channel, value)
            }),
        }
    }
}

impl<T> Index<FeatureType> for ChannelSet<T> {
    type Output = T;

    fn index(&self, channel: FeatureType) -> &T {
        self.get(channel)
    }
}

impl<T> IndexMut<FeatureType> for ChannelSet<T> {
    fn index_mut(&mut self, channel: FeatureType) -> &mut T {
        self.get_mut(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_matches_all_order() {
        for (i, channel) in FeatureType::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
    }

    #[test]
    fn test_channel_set_indexing() {
        let mut set = ChannelSet::from_fn(|c| c.index() * 10);
        assert_eq!(set[FeatureType::Brisk], 10);

        set[FeatureType::Akaze] += 1;
        assert_eq!(*set.get(FeatureType::Akaze), 21);

        let names: Vec<_> = set.map(|c, v| format!("{}:{}", c, v)).iter().map(|(_, s)| s.clone()).collect();
        assert_eq!(names, vec!["orb:0", "brisk:10", "akaze:21"]);
    }

    #[test]
    fn test_deserialize_channel_name() {
        let channel: FeatureType = serde_yaml::from_str("brisk").unwrap();
        assert_eq!(channel, FeatureType::Brisk);
    }
}
