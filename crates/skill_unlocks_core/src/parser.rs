//! Wikitext parser for `{{Level up table}}` skill pages.
//!
//! Everything here is pure text transformation. Malformed input never fails;
//! it yields fewer unlocks and leaves a diagnostic behind.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::model::{MAX_LEVEL, MEMBERS_ONLY, MIN_LEVEL, Skill, SkillData, Unlock, UnlockCategory};

const FIELD_SEPARATOR: char = '|';
const PREVIEW_CHARS: usize = 500;
const MIN_NAME_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Freeplay,
    Members,
}

impl Tier {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "freeplay" => Some(Self::Freeplay),
            "members" => Some(Self::Members),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Freeplay => "",
            Self::Members => MEMBERS_ONLY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableField<'a> {
    tier: Tier,
    level_token: &'a str,
    value: String,
}

struct CategoryRule {
    category: UnlockCategory,
    only_for: Option<Skill>,
    keywords: &'static [&'static str],
}

impl CategoryRule {
    fn matches(&self, lowercase_name: &str, skill: Skill) -> bool {
        if self.only_for.is_some_and(|owner| owner != skill) {
            return false;
        }
        self.keywords
            .iter()
            .any(|keyword| lowercase_name.contains(keyword))
    }
}

/// Evaluated top to bottom; the first matching rule decides the category.
const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        category: UnlockCategory::Spell,
        only_for: Some(Skill::Magic),
        keywords: &["spell", "teleport", "enchant"],
    },
    CategoryRule {
        category: UnlockCategory::Prayer,
        only_for: Some(Skill::Prayer),
        keywords: &["prayer"],
    },
    CategoryRule {
        category: UnlockCategory::Quest,
        only_for: None,
        keywords: &["quest", "miniquest"],
    },
    CategoryRule {
        category: UnlockCategory::Location,
        only_for: None,
        keywords: &["area", "location", "access"],
    },
    CategoryRule {
        category: UnlockCategory::Ability,
        only_for: None,
        keywords: &["ability", "can "],
    },
    CategoryRule {
        category: UnlockCategory::Activity,
        only_for: None,
        keywords: &["activity", "minigame"],
    },
    CategoryRule {
        category: UnlockCategory::Item,
        only_for: None,
        keywords: &[
            "make", "craft", "smith", "cook", "catch", "mine", "cut", "fletch", "brew", "create",
            "build", "grow", "wield", "wear", "equip",
        ],
    },
];

/// Parses a skill page, stamping the result with the current time.
pub fn parse_skill_page(skill: Skill, wikitext: &str) -> SkillData {
    parse_skill_page_at(skill, wikitext, Utc::now())
}

pub fn parse_skill_page_at(skill: Skill, wikitext: &str, parsed_at: DateTime<Utc>) -> SkillData {
    let mut data = SkillData::new(skill, parsed_at);

    let Some(block) = locate_table_block(wikitext) else {
        warn!(
            skill = %skill,
            preview = %preview(wikitext),
            "no level up table block found"
        );
        return data;
    };

    let fields = split_fields(block);
    let mut non_empty_fields = 0usize;
    for field in &fields {
        if field.value.trim().is_empty() {
            continue;
        }
        non_empty_fields += 1;

        let Some(level) = resolve_level(skill, field.level_token) else {
            continue;
        };
        for line in bullet_lines(&field.value) {
            if let Some(unlock) = build_unlock(skill, level, field.tier, line) {
                data.add_unlock(unlock);
            }
        }
    }

    debug!(
        skill = %skill,
        fields = fields.len(),
        non_empty_fields,
        unlocks = data.unlock_count(),
        "parsed level up table"
    );
    data
}

/// Resolves an unlock category from the lowercased name, skill-specific cues first.
pub fn categorize(name: &str, skill: Skill) -> UnlockCategory {
    let lowercase = name.to_lowercase();
    CATEGORY_RULES
        .iter()
        .find(|rule| rule.matches(&lowercase, skill))
        .map(|rule| rule.category)
        .unwrap_or(UnlockCategory::Other)
}

/// Turns one bullet line into plain display text. Requirement clauses are
/// left in place; see [`split_requirements`].
pub fn clean_unlock_text(text: &str) -> String {
    let text = plink_with_txt_regex().replace_all(text, |caps: &Captures| caps[1].trim().to_string());
    let text = plink_regex().replace_all(&text, |caps: &Captures| caps[1].trim().to_string());
    let text = skill_compare_regex().replace_all(&text, |caps: &Captures| {
        let first = caps[1].trim();
        let second = caps
            .get(2)
            .and_then(|value| value.as_str().split(FIELD_SEPARATOR).next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match second {
            Some(second) => format!("{first} {second}"),
            None => first.to_string(),
        }
    });
    let text = replace_wikilinks(&text);
    let text = remove_templates(&text);
    let text = text.replace("'''", "").replace("''", "");
    let text = normalize_spaces(&text);

    match text.strip_suffix("(with") {
        Some(stripped) => stripped.trim_end().to_string(),
        None => text,
    }
}

/// Splits `name (with requirement)` into `("name", "requirement")`.
pub fn split_requirements(cleaned: &str) -> (String, String) {
    match requirement_regex().captures(cleaned) {
        Some(caps) => {
            let start = caps.get(0).map(|whole| whole.start()).unwrap_or(cleaned.len());
            (
                cleaned[..start].trim().to_string(),
                caps[1].trim().to_string(),
            )
        }
        None => (cleaned.trim().to_string(), String::new()),
    }
}

fn locate_table_block(wikitext: &str) -> Option<&str> {
    table_block_regex()
        .captures(wikitext)
        .and_then(|caps| caps.get(1))
        .map(|block| block.as_str())
}

/// Re-joins segments that belong to one field. The separator also appears
/// inside nested templates, so a field name that follows a separator in the
/// middle of a line only opens a field when no template or link is left
/// open. A field name at the start of a line always opens one.
fn split_fields(block: &str) -> Vec<TableField<'_>> {
    let mut fields = Vec::new();
    let mut current: Option<TableField<'_>> = None;
    let mut at_line_start = true;

    for segment in block.split(FIELD_SEPARATOR) {
        let header = field_header_regex().captures(segment).and_then(|caps| {
            let tier = Tier::parse(caps.get(1)?.as_str())?;
            let level_token = caps.get(2)?.as_str();
            let value_start = caps.get(0)?.end();
            Some(TableField {
                tier,
                level_token,
                value: segment[value_start..].to_string(),
            })
        });
        let inside_markup = current
            .as_ref()
            .is_some_and(|field| has_unclosed_markup(&field.value));

        match header {
            Some(field) if at_line_start || !inside_markup => {
                if let Some(previous) = current.replace(field) {
                    fields.push(previous);
                }
            }
            _ => {
                if let Some(field) = current.as_mut() {
                    field.value.push(FIELD_SEPARATOR);
                    field.value.push_str(segment);
                }
            }
        }

        at_line_start = segment.trim_end_matches([' ', '\t']).ends_with('\n');
    }

    if let Some(last) = current {
        fields.push(last);
    }
    fields
}

fn has_unclosed_markup(value: &str) -> bool {
    value.matches("{{").count() > value.matches("}}").count()
        || value.matches("[[").count() > value.matches("]]").count()
}

fn resolve_level(skill: Skill, token: &str) -> Option<u8> {
    // TODO: `all` rows describe every level; they are bucketed under level 1
    // until the table's per-level semantics for them are settled.
    if token == "all" {
        return Some(MIN_LEVEL);
    }
    match token.parse::<u8>() {
        Ok(level) if (MIN_LEVEL..=MAX_LEVEL).contains(&level) => Some(level),
        _ => {
            warn!(skill = %skill, token, "skipping field with out-of-range level");
            None
        }
    }
}

fn bullet_lines(value: &str) -> impl Iterator<Item = &str> {
    value
        .lines()
        .filter_map(|line| line.trim().strip_prefix('*'))
        .map(|rest| rest.trim_start_matches('*').trim())
        .filter(|rest| !rest.is_empty())
}

fn build_unlock(skill: Skill, level: u8, tier: Tier, line: &str) -> Option<Unlock> {
    let cleaned = clean_unlock_text(line);
    let (name, requirements) = split_requirements(&cleaned);
    if name.chars().count() < MIN_NAME_CHARS {
        return None;
    }

    Some(Unlock {
        level,
        category: categorize(&name, skill),
        name,
        description: tier.description().to_string(),
        requirements,
    })
}

fn replace_wikilinks(content: &str) -> String {
    let bytes = content.as_bytes();
    let mut out = String::with_capacity(content.len());
    let mut copied_until = 0usize;
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'[' && bytes[cursor + 1] == b'[' {
            let start = cursor + 2;
            let mut end = start;
            while end + 1 < bytes.len() {
                if bytes[end] == b']' && bytes[end + 1] == b']' {
                    break;
                }
                end += 1;
            }
            if end + 1 >= bytes.len() {
                break;
            }

            out.push_str(&content[copied_until..cursor]);
            out.push_str(render_wikilink(&content[start..end]));
            cursor = end + 2;
            copied_until = cursor;
            continue;
        }
        cursor += 1;
    }

    out.push_str(&content[copied_until..]);
    out
}

fn render_wikilink(inner: &str) -> &str {
    match inner.split_once(FIELD_SEPARATOR) {
        Some((_, alias)) if !alias.trim().is_empty() => alias.trim(),
        Some((target, _)) => target.trim(),
        None => inner.trim(),
    }
}

fn remove_templates(text: &str) -> String {
    let mut current = text.to_string();
    // Innermost templates go first, so nested ones unwind one layer per pass.
    while template_regex().is_match(&current) {
        current = template_regex().replace_all(&current, "").into_owned();
    }
    current
}

fn normalize_spaces(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_was_space = false;

    for ch in value.chars() {
        if ch.is_whitespace() {
            if !previous_was_space {
                output.push(' ');
                previous_was_space = true;
            }
        } else {
            output.push(ch);
            previous_was_space = false;
        }
    }

    output.trim().to_string()
}

fn preview(wikitext: &str) -> String {
    let mut chars = wikitext.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn compile(cell: &'static OnceLock<Regex>, pattern: &'static str) -> &'static Regex {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => re,
        Err(_) => unreachable!("static regex pattern is valid"),
    })
}

fn table_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compile(&RE, r"\{\{Level up table\s*\n((?s:.*?))\n\}\}[ \t]*(?:\r?\n|$)")
}

fn field_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compile(&RE, r"^\s*(freeplay|members)(\d+|all)\s*=")
}

fn plink_with_txt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compile(
        &RE,
        r"\{\{[Pp]link\|[^|}]+(?:\|[^|}]*)*\|txt=([^|}]+)(?:\|[^}]*)*\}\}",
    )
}

fn plink_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compile(&RE, r"\{\{[Pp]link\|([^|}]+)(?:\|[^}]*)?\}\}[es]?")
}

fn skill_compare_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compile(&RE, r"\{\{SCP\|([^|}]+)(?:\|([^}]+))?\}\}")
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compile(&RE, r"\{\{[^{}]*\}\}")
}

fn requirement_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compile(&RE, r"\((?:with\s+)?([^)]+)\)")
}
