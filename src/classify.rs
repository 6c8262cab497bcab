//! Heuristic content categorization for discovered files.
//!
//! Extension hits win, then platform hints, then keyword rules over the
//! bundle/product/file text, then optional external suggestions. Every hit is
//! kept as a tag; the first one becomes the primary category.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::model::extension_of;

/// The fixed category vocabulary.
pub const CATEGORIES: &[&str] = &[
    "ebook",
    "comic",
    "music",
    "sfx",
    "audio",
    "tutorial",
    "software",
    "android",
    "archive",
    "key",
    "other",
    "art",
    "tileset",
    "sprites",
    "characters",
    "ui",
    "3d",
    "rpg",
    "rpg maker",
    "unity",
    "unreal",
    "source",
    "tool",
];

const ARCHIVE: &str = "archive";
const ARCHIVE_EXTS: &[&str] = &["zip", "tar", "gz", "bz2", "7z", "rar"];

/// Extension to category.
fn category_for_ext(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "pdf" | "epub" | "mobi" | "azw3" => "ebook",
        "cbz" | "cbr" => "comic",
        "mp3" | "flac" | "aac" | "ogg" => "music",
        "wav" => "sfx",
        "mp4" | "mkv" | "avi" | "mov" => "tutorial",
        "unitypackage" => "unity",
        "fbx" | "obj" | "blend" => "3d",
        "uasset" | "uproject" => "unreal",
        "psd" | "png" | "jpg" | "jpeg" => "art",
        "exe" | "msi" | "dmg" | "pkg" | "deb" | "rpm" | "sh" | "appimage" | "iso" | "rom"
        | "img" => "software",
        "apk" => "android",
        _ => return None,
    })
}

/// Platform hint to category.
fn category_for_platform(platform: &str) -> Option<&'static str> {
    Some(match platform {
        "audio" => "audio",
        "android" | "ebook_apk" => "android",
        "linux" | "mac" | "macos" | "osx" | "windows" => "software",
        "steam" | "origin" | "uplay" => "game",
        "video" => "tutorial",
        "ebook" | "ebook_pdf" | "ebook_epub" | "ebook_mobi" => "ebook",
        _ => return None,
    })
}

/// Keyword rules, checked in order; the first match wins.
static TEXT_RULES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("comic", r"comic|manga|graphic novel|cbz|cbr"),
        ("ebook", r"ebook|book|novel|guide|pdf|epub|mobi"),
        ("music", r"soundtrack|ost|music|score|flac|mp3"),
        ("sfx", r"sfx|sound effect|fx pack|foley|sound pack|soundfx"),
        ("tutorial", r"video|tutorial|course|webinar|lesson|masterclass|recording"),
        ("key", r"dlc|key|activation"),
        ("unity", r"unitypackage|unity\s"),
        ("unreal", r"unreal|ue4|ue5|uasset|uproject"),
        ("3d", r"3d model|3d pack|low poly|fbx|obj|blend|poly"),
        ("rpg maker", r"rpg maker|rmmv|rm2k|rpgmaker|rmxp|rmvx|rmz"),
        ("rpg", r"rpg\b|role[- ]?playing"),
        ("tileset", r"tile(set)?|tileset|grid map"),
        (
            "sprites",
            r"sprite|spritesheet|pixel art|icon pack|ui pack|art pack|texture|background|asset pack|game dev assets",
        ),
        ("characters", r"character|npc|enemy pack|portraits?|busts?"),
        ("ui", r"ui kit|interface|hud|menus?"),
        ("software", r"linux|windows|mac|appimage|installer|exe|client|tool"),
        (
            "source",
            r"source code|sourcecode|unity project|unreal project|godot|plugin|addon",
        ),
    ]
    .into_iter()
    .map(|(cat, pattern)| (cat, Regex::new(pattern).expect("valid category regex")))
    .collect()
});

/// First keyword rule matching the lowercased `text`.
#[must_use]
pub fn text_rule(text: &str) -> Option<&'static str> {
    TEXT_RULES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(cat, _)| *cat)
}

/// Maps a free-text suggestion onto the category vocabulary.
#[must_use]
pub fn normalize_category(word: &str) -> Option<&'static str> {
    let word = word.trim().to_lowercase();
    let aliased = match word.as_str() {
        "soundtrack" => "music",
        "sound" => "sfx",
        "book" | "novel" => "ebook",
        "course" | "video" | "video course" => "tutorial",
        "app" | "application" => "software",
        "sprite" | "sprite pack" => "sprites",
        "tile" | "tiles" | "tilesets" => "tileset",
        "character" | "character pack" => "characters",
        "icons" | "hud" | "interface" => "ui",
        "tooling" | "utility" => "tool",
        "code" | "sourcecode" | "project" => "source",
        other => other,
    };
    CATEGORIES.iter().copied().find(|c| *c == aliased)
}

/// Extracts allowed categories from a free-text answer.
///
/// Splits on commas, slashes, pipes, semicolons and newlines; falls back to
/// scanning the whole answer for vocabulary words.
#[must_use]
pub fn parse_category_list(answer: &str) -> Vec<String> {
    let cleaned = answer.trim().to_lowercase();
    if cleaned.is_empty() {
        return Vec::new();
    }
    let mut parts: Vec<&str> = cleaned
        .split([',', '\\', '|', '/', ';', '\n'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        parts = cleaned.split_whitespace().collect();
    }

    let mut found: Vec<String> = Vec::new();
    for part in parts {
        if let Some(cat) = normalize_category(part)
            && !found.iter().any(|f| f == cat)
        {
            found.push(cat.to_string());
        }
    }
    if found.is_empty() {
        found = CATEGORIES
            .iter()
            .filter(|c| cleaned.contains(**c))
            .map(|c| (*c).to_string())
            .collect();
    }
    found
}

/// Context handed to an external suggester.
#[derive(Debug, Clone)]
pub struct ClassifyRequest<'a> {
    pub file_name: &'a str,
    pub platform: &'a str,
    pub bundle_title: &'a str,
    pub product_title: &'a str,
}

/// External collaborator that proposes categories and descriptions.
///
/// Implementations must degrade to empty answers rather than fail.
#[async_trait]
pub trait CategorySuggester: Send + Sync {
    /// Zero or more vocabulary categories for the file.
    async fn suggest_categories(&self, request: &ClassifyRequest<'_>) -> Vec<String>;

    /// A short neutral description, if one could be produced.
    async fn describe(&self, request: &ClassifyRequest<'_>) -> Option<String>;
}

/// Outcome of classifying one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub primary: String,
    /// Every other category that matched, de-duplicated.
    pub extra_tags: Vec<String>,
}

impl Classification {
    /// Primary category followed by the extra tags.
    #[must_use]
    pub fn all_tags(&self) -> Vec<String> {
        std::iter::once(self.primary.clone())
            .chain(self.extra_tags.iter().cloned())
            .collect()
    }
}

/// Maps file context to a primary category plus extra tags.
#[derive(Clone, Default)]
pub struct Classifier {
    suggester: Option<Arc<dyn CategorySuggester>>,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("suggester", &self.suggester.is_some())
            .finish()
    }
}

impl Classifier {
    /// Creates a classifier that uses only the built-in tables and rules.
    #[must_use]
    pub fn new() -> Self {
        Self { suggester: None }
    }

    /// Creates a classifier that also merges external suggestions.
    #[must_use]
    pub fn with_suggester(suggester: Arc<dyn CategorySuggester>) -> Self {
        Self {
            suggester: Some(suggester),
        }
    }

    /// Returns the external suggester, if any.
    #[must_use]
    pub fn suggester(&self) -> Option<&Arc<dyn CategorySuggester>> {
        self.suggester.as_ref()
    }

    /// Classifies using tables and rules only.
    #[must_use]
    pub fn classify(
        &self,
        file_name: &str,
        platform: &str,
        bundle_title: &str,
        product_title: &str,
    ) -> Classification {
        classify_with(file_name, platform, bundle_title, product_title, &[])
    }

    /// Classifies and merges external suggestions when a suggester is set.
    pub async fn classify_with_suggestions(&self, request: &ClassifyRequest<'_>) -> Classification {
        let suggestions = match &self.suggester {
            Some(s) => s.suggest_categories(request).await,
            None => Vec::new(),
        };
        classify_with(
            request.file_name,
            request.platform,
            request.bundle_title,
            request.product_title,
            &suggestions,
        )
    }
}

/// The decision procedure shared by both entry points.
fn classify_with(
    file_name: &str,
    platform: &str,
    bundle_title: &str,
    product_title: &str,
    suggestions: &[String],
) -> Classification {
    let ext = extension_of(file_name);
    let platform = platform.to_lowercase();
    let text = format!("{bundle_title} {product_title} {file_name}").to_lowercase();

    let mut primary: Option<String> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut hit = |cat: &str, primary: &mut Option<String>| {
        if primary.is_none() {
            *primary = Some(cat.to_string());
        }
        if !tags.iter().any(|t| t == cat) {
            tags.push(cat.to_string());
        }
    };

    if let Some(cat) = category_for_ext(&ext).filter(|c| *c != ARCHIVE) {
        hit(cat, &mut primary);
    }
    if let Some(cat) = category_for_platform(&platform).filter(|c| *c != ARCHIVE) {
        hit(cat, &mut primary);
    }
    if let Some(cat) = text_rule(&text) {
        hit(cat, &mut primary);
    }
    for suggestion in suggestions {
        if let Some(cat) = normalize_category(suggestion) {
            hit(cat, &mut primary);
        }
    }
    if primary.is_none() && ARCHIVE_EXTS.contains(&ext.as_str()) {
        hit(ARCHIVE, &mut primary);
    }
    if primary.is_none()
        && let Some(cat) = category_for_ext(&ext)
    {
        hit(cat, &mut primary);
    }
    if primary.is_none() {
        hit("other", &mut primary);
    }

    let primary = primary.unwrap_or_else(|| "other".to_string());
    let extra_tags = tags.into_iter().filter(|t| *t != primary).collect();
    Classification {
        primary,
        extra_tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(file: &str, platform: &str, bundle: &str, product: &str) -> Classification {
        Classifier::new().classify(file, platform, bundle, product)
    }

    #[test]
    fn pdf_is_always_ebook() {
        let c = classify("manual.pdf", "windows", "Music Bundle", "Soundtrack Deluxe");
        assert_eq!(c.primary, "ebook");
        assert!(c.extra_tags.contains(&"software".to_string()));
        // Only the first keyword rule applies, and "pdf" in the text hits ebook.
        assert!(!c.extra_tags.contains(&"music".to_string()));
    }

    #[test]
    fn plain_zip_falls_back_to_archive() {
        let c = classify("data.zip", "", "", "Thing");
        assert_eq!(c.primary, "archive");
        assert!(c.extra_tags.is_empty());
    }

    #[test]
    fn unknown_extension_is_other() {
        let c = classify("data.xyz", "", "", "Thing");
        assert_eq!(c.primary, "other");
    }

    #[test]
    fn platform_hint_beats_text() {
        let c = classify("game.zip", "linux", "Indie Bundle", "Space Game");
        assert_eq!(c.primary, "software");
    }

    #[test]
    fn keyword_rules_classify_zip_content() {
        assert_eq!(classify("pack.zip", "", "Gamedev", "Forest Tileset").primary, "tileset");
        assert_eq!(classify("ost.zip", "", "", "Epic Soundtrack").primary, "music");
        assert_eq!(
            classify("rm.zip", "", "RPG Maker Bundle", "Town Pack").primary,
            "rpg maker"
        );
    }

    #[test]
    fn extra_tags_exclude_primary_and_are_unique() {
        let c = classify("book.epub", "ebook", "Books", "A Novel");
        assert_eq!(c.primary, "ebook");
        assert!(!c.extra_tags.contains(&"ebook".to_string()));
        assert_eq!(c.all_tags()[0], "ebook");
    }

    #[test]
    fn suggestions_are_merged_after_rules() {
        let c = classify_with("x.zip", "", "", "Thing", &["Sprite".into(), "bogus".into()]);
        assert_eq!(c.primary, "sprites");
        let c = classify_with("x.pdf", "", "", "Thing", &["course".into()]);
        assert_eq!(c.primary, "ebook");
        assert_eq!(c.extra_tags, vec!["tutorial".to_string()]);
    }

    #[test]
    fn normalize_category_applies_aliases() {
        assert_eq!(normalize_category(" Soundtrack "), Some("music"));
        assert_eq!(normalize_category("tiles"), Some("tileset"));
        assert_eq!(normalize_category("rpg maker"), Some("rpg maker"));
        assert_eq!(normalize_category("spaceship"), None);
    }

    #[test]
    fn parse_category_list_handles_separators_and_fallback() {
        assert_eq!(parse_category_list("Music / SFX"), vec!["music", "sfx"]);
        assert_eq!(parse_category_list("tileset;sprites"), vec!["tileset", "sprites"]);
        assert_eq!(parse_category_list("I think this is an ebook."), vec!["ebook"]);
        assert!(parse_category_list("   ").is_empty());
    }

    struct FixedSuggester(Vec<String>);

    #[async_trait]
    impl CategorySuggester for FixedSuggester {
        async fn suggest_categories(&self, _request: &ClassifyRequest<'_>) -> Vec<String> {
            self.0.clone()
        }

        async fn describe(&self, _request: &ClassifyRequest<'_>) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn suggester_is_consulted_when_present() {
        let classifier = Classifier::with_suggester(Arc::new(FixedSuggester(vec!["ui".into()])));
        let request = ClassifyRequest {
            file_name: "x.zip",
            platform: "",
            bundle_title: "",
            product_title: "Thing",
        };
        let c = classifier.classify_with_suggestions(&request).await;
        assert_eq!(c.primary, "ui");

        let plain = Classifier::new().classify_with_suggestions(&request).await;
        assert_eq!(plain.primary, "archive");
    }
}
