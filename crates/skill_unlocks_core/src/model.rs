use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 99;

pub const MEMBERS_ONLY: &str = "Members only";

pub type SkillDataMap = BTreeMap<Skill, SkillData>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Skill {
    Attack,
    Defence,
    Strength,
    Hitpoints,
    Ranged,
    Prayer,
    Magic,
    Cooking,
    Woodcutting,
    Fletching,
    Fishing,
    Firemaking,
    Crafting,
    Smithing,
    Mining,
    Herblore,
    Agility,
    Thieving,
    Slayer,
    Farming,
    Runecraft,
    Hunter,
    Construction,
    Overall,
}

impl Skill {
    pub const ALL: [Skill; 24] = [
        Self::Attack,
        Self::Defence,
        Self::Strength,
        Self::Hitpoints,
        Self::Ranged,
        Self::Prayer,
        Self::Magic,
        Self::Cooking,
        Self::Woodcutting,
        Self::Fletching,
        Self::Fishing,
        Self::Firemaking,
        Self::Crafting,
        Self::Smithing,
        Self::Mining,
        Self::Herblore,
        Self::Agility,
        Self::Thieving,
        Self::Slayer,
        Self::Farming,
        Self::Runecraft,
        Self::Hunter,
        Self::Construction,
        Self::Overall,
    ];

    /// Every skill that has its own unlock table (everything except `Overall`).
    pub fn trainable() -> impl Iterator<Item = Skill> {
        Self::ALL.into_iter().filter(|skill| *skill != Self::Overall)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attack => "attack",
            Self::Defence => "defence",
            Self::Strength => "strength",
            Self::Hitpoints => "hitpoints",
            Self::Ranged => "ranged",
            Self::Prayer => "prayer",
            Self::Magic => "magic",
            Self::Cooking => "cooking",
            Self::Woodcutting => "woodcutting",
            Self::Fletching => "fletching",
            Self::Fishing => "fishing",
            Self::Firemaking => "firemaking",
            Self::Crafting => "crafting",
            Self::Smithing => "smithing",
            Self::Mining => "mining",
            Self::Herblore => "herblore",
            Self::Agility => "agility",
            Self::Thieving => "thieving",
            Self::Slayer => "slayer",
            Self::Farming => "farming",
            Self::Runecraft => "runecraft",
            Self::Hunter => "hunter",
            Self::Construction => "construction",
            Self::Overall => "overall",
        }
    }

    /// Canonical wiki page title for the skill. `Overall` has no page of its own.
    pub fn page_title(self) -> Option<&'static str> {
        let title = match self {
            Self::Attack => "Attack",
            Self::Defence => "Defence",
            Self::Strength => "Strength",
            Self::Hitpoints => "Hitpoints",
            Self::Ranged => "Ranged",
            Self::Prayer => "Prayer",
            Self::Magic => "Magic",
            Self::Cooking => "Cooking",
            Self::Woodcutting => "Woodcutting",
            Self::Fletching => "Fletching",
            Self::Fishing => "Fishing",
            Self::Firemaking => "Firemaking",
            Self::Crafting => "Crafting",
            Self::Smithing => "Smithing",
            Self::Mining => "Mining",
            Self::Herblore => "Herblore",
            Self::Agility => "Agility",
            Self::Thieving => "Thieving",
            Self::Slayer => "Slayer",
            Self::Farming => "Farming",
            Self::Runecraft => "Runecraft",
            Self::Hunter => "Hunter",
            Self::Construction => "Construction",
            Self::Overall => return None,
        };
        Some(title)
    }
}

impl fmt::Display for Skill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Skill {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        for skill in Self::ALL {
            if skill.as_str().eq_ignore_ascii_case(trimmed) {
                return Ok(skill);
            }
        }
        // The wiki spells it "Runecraft"; players often type "runecrafting".
        if trimmed.eq_ignore_ascii_case("runecrafting") {
            return Ok(Self::Runecraft);
        }
        bail!("unknown skill: {value}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockCategory {
    Item,
    Activity,
    Spell,
    Prayer,
    Ability,
    Location,
    Quest,
    Other,
}

impl UnlockCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Item => "item",
            Self::Activity => "activity",
            Self::Spell => "spell",
            Self::Prayer => "prayer",
            Self::Ability => "ability",
            Self::Location => "location",
            Self::Quest => "quest",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for UnlockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unlock {
    pub level: u8,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub requirements: String,
    pub category: UnlockCategory,
}

impl Unlock {
    pub fn is_members_only(&self) -> bool {
        self.description == MEMBERS_ONLY
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillLevelData {
    pub level: u8,
    pub unlocks: Vec<Unlock>,
}

impl SkillLevelData {
    fn new(level: u8) -> Self {
        Self {
            level,
            unlocks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillData {
    pub skill: Skill,
    #[serde(default)]
    pub level_data: BTreeMap<u8, SkillLevelData>,
    pub last_updated: DateTime<Utc>,
}

impl SkillData {
    pub fn new(skill: Skill, last_updated: DateTime<Utc>) -> Self {
        Self {
            skill,
            level_data: BTreeMap::new(),
            last_updated,
        }
    }

    pub fn empty(skill: Skill) -> Self {
        Self::new(skill, Utc::now())
    }

    /// Appends the unlock to its level group, creating the group on first use.
    pub fn add_unlock(&mut self, unlock: Unlock) {
        self.level_data
            .entry(unlock.level)
            .or_insert_with(|| SkillLevelData::new(unlock.level))
            .unlocks
            .push(unlock);
    }

    pub fn unlocks_for_level(&self, level: u8) -> &[Unlock] {
        self.level_data
            .get(&level)
            .map(|group| group.unlocks.as_slice())
            .unwrap_or(&[])
    }

    pub fn all_unlocks(&self) -> impl Iterator<Item = &Unlock> {
        self.level_data.values().flat_map(|group| group.unlocks.iter())
    }

    pub fn unlocks_up_to_level(&self, max_level: u8) -> impl Iterator<Item = &SkillLevelData> {
        self.level_data.range(..=max_level).map(|(_, group)| group)
    }

    pub fn next_unlock(&self, current_level: u8) -> Option<&SkillLevelData> {
        let start = current_level.checked_add(1)?;
        self.level_data.range(start..).next().map(|(_, group)| group)
    }

    pub fn unlock_count(&self) -> usize {
        self.level_data.values().map(|group| group.unlocks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.level_data.is_empty()
    }
}
