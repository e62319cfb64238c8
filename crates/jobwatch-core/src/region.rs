//! Location text to Danish region.
//!
//! A listing's free-text location ("2100 København Ø", "Aarhus C og mulighed for
//! hjemmearbejde", "Odense SØ / Svendborg") is reduced to city tokens, which are
//! looked up first in operator overrides and then in a built-in city table.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "Hovedstaden")]
    Hovedstaden,
    #[serde(rename = "Sjælland")]
    Sjaelland,
    #[serde(rename = "Fyn")]
    Fyn,
    #[serde(rename = "Syd- og Sønderjylland")]
    SydOgSoenderjylland,
    #[serde(rename = "Midtjylland")]
    Midtjylland,
    #[serde(rename = "Nordjylland")]
    Nordjylland,
    #[serde(rename = "Udlandet")]
    Udlandet,
    #[serde(rename = "Ukendt")]
    Ukendt,
}

impl Region {
    pub const ALL: [Region; 8] = [
        Region::Hovedstaden,
        Region::Sjaelland,
        Region::Fyn,
        Region::SydOgSoenderjylland,
        Region::Midtjylland,
        Region::Nordjylland,
        Region::Udlandet,
        Region::Ukendt,
    ];

    /// Stored and displayed name.
    pub fn as_str(self) -> &'static str {
        match self {
            Region::Hovedstaden => "Hovedstaden",
            Region::Sjaelland => "Sjælland",
            Region::Fyn => "Fyn",
            Region::SydOgSoenderjylland => "Syd- og Sønderjylland",
            Region::Midtjylland => "Midtjylland",
            Region::Nordjylland => "Nordjylland",
            Region::Udlandet => "Udlandet",
            Region::Ukendt => "Ukendt",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown region {0:?}")]
pub struct UnknownRegion(pub String);

impl FromStr for Region {
    type Err = UnknownRegion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Region::ALL
            .into_iter()
            .find(|region| region.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownRegion(s.to_string()))
    }
}

const CITY_REGIONS: &[(&str, Region)] = &[
    ("københavn", Region::Hovedstaden),
    ("copenhagen", Region::Hovedstaden),
    ("frederiksberg", Region::Hovedstaden),
    ("valby", Region::Hovedstaden),
    ("vanløse", Region::Hovedstaden),
    ("brønshøj", Region::Hovedstaden),
    ("amager", Region::Hovedstaden),
    ("ørestad", Region::Hovedstaden),
    ("hellerup", Region::Hovedstaden),
    ("gentofte", Region::Hovedstaden),
    ("charlottenlund", Region::Hovedstaden),
    ("kongens lyngby", Region::Hovedstaden),
    ("kgs. lyngby", Region::Hovedstaden),
    ("kgs lyngby", Region::Hovedstaden),
    ("lyngby", Region::Hovedstaden),
    ("virum", Region::Hovedstaden),
    ("holte", Region::Hovedstaden),
    ("nærum", Region::Hovedstaden),
    ("søborg", Region::Hovedstaden),
    ("gladsaxe", Region::Hovedstaden),
    ("herlev", Region::Hovedstaden),
    ("ballerup", Region::Hovedstaden),
    ("skovlunde", Region::Hovedstaden),
    ("måløv", Region::Hovedstaden),
    ("rødovre", Region::Hovedstaden),
    ("hvidovre", Region::Hovedstaden),
    ("glostrup", Region::Hovedstaden),
    ("albertslund", Region::Hovedstaden),
    ("brøndby", Region::Hovedstaden),
    ("vallensbæk", Region::Hovedstaden),
    ("ishøj", Region::Hovedstaden),
    ("taastrup", Region::Hovedstaden),
    ("høje-taastrup", Region::Hovedstaden),
    ("kastrup", Region::Hovedstaden),
    ("tårnby", Region::Hovedstaden),
    ("dragør", Region::Hovedstaden),
    ("hillerød", Region::Hovedstaden),
    ("helsingør", Region::Hovedstaden),
    ("hørsholm", Region::Hovedstaden),
    ("rungsted kyst", Region::Hovedstaden),
    ("allerød", Region::Hovedstaden),
    ("birkerød", Region::Hovedstaden),
    ("farum", Region::Hovedstaden),
    ("værløse", Region::Hovedstaden),
    ("smørum", Region::Hovedstaden),
    ("stenløse", Region::Hovedstaden),
    ("ølstykke", Region::Hovedstaden),
    ("frederikssund", Region::Hovedstaden),
    ("frederiksværk", Region::Hovedstaden),
    ("hundested", Region::Hovedstaden),
    ("gilleleje", Region::Hovedstaden),
    ("rønne", Region::Hovedstaden),
    ("bornholm", Region::Hovedstaden),
    ("roskilde", Region::Sjaelland),
    ("køge", Region::Sjaelland),
    ("greve", Region::Sjaelland),
    ("solrød strand", Region::Sjaelland),
    ("lejre", Region::Sjaelland),
    ("holbæk", Region::Sjaelland),
    ("kalundborg", Region::Sjaelland),
    ("næstved", Region::Sjaelland),
    ("slagelse", Region::Sjaelland),
    ("korsør", Region::Sjaelland),
    ("skælskør", Region::Sjaelland),
    ("ringsted", Region::Sjaelland),
    ("sorø", Region::Sjaelland),
    ("haslev", Region::Sjaelland),
    ("faxe", Region::Sjaelland),
    ("vordingborg", Region::Sjaelland),
    ("nykøbing f", Region::Sjaelland),
    ("nykøbing falster", Region::Sjaelland),
    ("nykøbing sj", Region::Sjaelland),
    ("nakskov", Region::Sjaelland),
    ("maribo", Region::Sjaelland),
    ("tølløse", Region::Sjaelland),
    ("odense", Region::Fyn),
    ("svendborg", Region::Fyn),
    ("nyborg", Region::Fyn),
    ("middelfart", Region::Fyn),
    ("faaborg", Region::Fyn),
    ("assens", Region::Fyn),
    ("kerteminde", Region::Fyn),
    ("bogense", Region::Fyn),
    ("ringe", Region::Fyn),
    ("otterup", Region::Fyn),
    ("rudkøbing", Region::Fyn),
    ("ærøskøbing", Region::Fyn),
    ("esbjerg", Region::SydOgSoenderjylland),
    ("kolding", Region::SydOgSoenderjylland),
    ("vejle", Region::SydOgSoenderjylland),
    ("fredericia", Region::SydOgSoenderjylland),
    ("billund", Region::SydOgSoenderjylland),
    ("grindsted", Region::SydOgSoenderjylland),
    ("varde", Region::SydOgSoenderjylland),
    ("ribe", Region::SydOgSoenderjylland),
    ("vejen", Region::SydOgSoenderjylland),
    ("haderslev", Region::SydOgSoenderjylland),
    ("aabenraa", Region::SydOgSoenderjylland),
    ("sønderborg", Region::SydOgSoenderjylland),
    ("tønder", Region::SydOgSoenderjylland),
    ("padborg", Region::SydOgSoenderjylland),
    ("aarhus", Region::Midtjylland),
    ("århus", Region::Midtjylland),
    ("viby", Region::Midtjylland),
    ("risskov", Region::Midtjylland),
    ("højbjerg", Region::Midtjylland),
    ("brabrand", Region::Midtjylland),
    ("tranbjerg", Region::Midtjylland),
    ("lystrup", Region::Midtjylland),
    ("hinnerup", Region::Midtjylland),
    ("hammel", Region::Midtjylland),
    ("skanderborg", Region::Midtjylland),
    ("odder", Region::Midtjylland),
    ("horsens", Region::Midtjylland),
    ("hedensted", Region::Midtjylland),
    ("silkeborg", Region::Midtjylland),
    ("herning", Region::Midtjylland),
    ("ikast", Region::Midtjylland),
    ("brande", Region::Midtjylland),
    ("holstebro", Region::Midtjylland),
    ("struer", Region::Midtjylland),
    ("lemvig", Region::Midtjylland),
    ("ringkøbing", Region::Midtjylland),
    ("skive", Region::Midtjylland),
    ("viborg", Region::Midtjylland),
    ("randers", Region::Midtjylland),
    ("grenaa", Region::Midtjylland),
    ("ebeltoft", Region::Midtjylland),
    ("aalborg", Region::Nordjylland),
    ("ålborg", Region::Nordjylland),
    ("nørresundby", Region::Nordjylland),
    ("hjørring", Region::Nordjylland),
    ("frederikshavn", Region::Nordjylland),
    ("skagen", Region::Nordjylland),
    ("sæby", Region::Nordjylland),
    ("brønderslev", Region::Nordjylland),
    ("thisted", Region::Nordjylland),
    ("hobro", Region::Nordjylland),
    ("aars", Region::Nordjylland),
    ("løgstør", Region::Nordjylland),
    ("fjerritslev", Region::Nordjylland),
    ("nykøbing m", Region::Nordjylland),
    ("nykøbing mors", Region::Nordjylland),
    ("malmö", Region::Udlandet),
    ("malmø", Region::Udlandet),
    ("lund", Region::Udlandet),
    ("stockholm", Region::Udlandet),
    ("göteborg", Region::Udlandet),
    ("oslo", Region::Udlandet),
    ("helsinki", Region::Udlandet),
    ("hamburg", Region::Udlandet),
    ("flensburg", Region::Udlandet),
    ("berlin", Region::Udlandet),
    ("london", Region::Udlandet),
    ("amsterdam", Region::Udlandet),
];

static BUILTIN: LazyLock<HashMap<&'static str, Region>> = LazyLock::new(|| CITY_REGIONS.iter().copied().collect());

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i),|/|\|| - |\s+og\s+|\s+and\s+").unwrap());
static HOME_OFFICE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(og\s+)?mulighed\s+for\s+hjemmearbejde.*$").unwrap());
static WORK_MODE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+(remote|hybrid|onsite).*$").unwrap());
static PARENTHESES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\([^)]*\)\s*").unwrap());
static POSTCODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(dk-)?\d{4}\s+").unwrap());
static DISTRICT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-zæøåäö.-]+)\s+[a-zæøå]{1,3}$").unwrap());

/// Words that mark a token as something other than a place name.
const NON_CITY_WORDS: &[&str] = &[
    "company", "firma", "virksomhed", "holding", "group", "afdeling", "team", "consulting", "services",
    "solutions", "remote", "hybrid", "onsite", "hjemmearbejde", "denmark", "danmark", "scandinavia", "europe",
    "international", "udlandet", "office", "kontor", "location", "area", "region", "zone", "flere", "arbejdssteder",
];

fn clean_token(token: &str) -> String {
    let t = HOME_OFFICE_SUFFIX.replace(token.trim(), "");
    let t = WORK_MODE_SUFFIX.replace(&t, "");
    let t = PARENTHESES.replace_all(&t, " ");
    let t = t.to_lowercase();
    let t = POSTCODE.replace(t.trim(), "");
    t.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c == ',' || c == '-' || c == '/' || c.is_whitespace())
        .to_string()
}

fn plausible_city(token: &str) -> bool {
    let len = token.chars().count();
    (2..=50).contains(&len)
        && token.split_whitespace().count() < 5
        && !token.chars().next().is_some_and(|c| c.is_ascii_digit())
        && !token
            .split(|c: char| c.is_whitespace() || c == '-' || c == '.')
            .any(|word| NON_CITY_WORDS.contains(&word))
}

/// Candidate city tokens of a location, most specific first within each token:
/// the whole token, then the token with a district suffix ("ø", "c", "sv") removed.
pub fn city_tokens(location: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for part in SEPARATORS.split(location) {
        let token = clean_token(part);
        if !plausible_city(&token) {
            continue;
        }
        let base = DISTRICT
            .captures(&token)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());
        if !tokens.contains(&token) {
            tokens.push(token);
        }
        if let Some(base) = base.filter(|b| plausible_city(b) && !tokens.contains(b)) {
            tokens.push(base);
        }
    }
    tokens
}

/// City to region resolution with operator overrides taking precedence over
/// the built-in table.
#[derive(Debug, Clone, Default)]
pub struct RegionLookup {
    overrides: HashMap<String, Region>,
}

impl RegionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: impl IntoIterator<Item = (String, Region)>) -> Self {
        Self {
            overrides: overrides
                .into_iter()
                .map(|(city, region)| (city.trim().to_lowercase(), region))
                .collect(),
        }
    }

    pub fn city_region(&self, city: &str) -> Option<Region> {
        let city = city.trim().to_lowercase();
        self.overrides
            .get(&city)
            .copied()
            .or_else(|| BUILTIN.get(city.as_str()).copied())
    }

    /// First city token of `location` with a known region, with that region.
    pub fn resolve(&self, location: &str) -> Option<(String, Region)> {
        city_tokens(location)
            .into_iter()
            .find_map(|city| self.city_region(&city).map(|region| (city, region)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn district_suffixes_and_postcodes_are_stripped() {
        assert_eq!(city_tokens("2100 København Ø"), vec!["københavn ø", "københavn"]);
        assert_eq!(city_tokens("Aarhus C og mulighed for hjemmearbejde"), vec!["aarhus c", "aarhus"]);
        assert_eq!(city_tokens("Odense SØ / Svendborg"), vec!["odense sø", "odense", "svendborg"]);
    }

    #[test]
    fn non_city_tokens_are_dropped() {
        assert!(city_tokens("Hybrid, Danmark").is_empty());
        assert!(city_tokens("Flere arbejdssteder").is_empty());
        assert!(city_tokens("").is_empty());
    }

    #[test]
    fn resolves_through_the_builtin_table() {
        let lookup = RegionLookup::new();
        assert_eq!(
            lookup.resolve("København V"),
            Some(("københavn".to_string(), Region::Hovedstaden))
        );
        assert_eq!(lookup.resolve("Remote, Viby J").map(|(_, r)| r), Some(Region::Midtjylland));
        assert_eq!(lookup.resolve("Nykøbing F").map(|(_, r)| r), Some(Region::Sjaelland));
        assert_eq!(lookup.resolve("Kgs. Lyngby").map(|(_, r)| r), Some(Region::Hovedstaden));
        assert_eq!(lookup.resolve("Malmö (Sverige)").map(|(_, r)| r), Some(Region::Udlandet));
        assert_eq!(lookup.resolve("Atlantis"), None);
    }

    #[test]
    fn overrides_win_over_the_builtin_table() {
        let lookup = RegionLookup::with_overrides([
            ("Viby".to_string(), Region::Sjaelland),
            ("atlantis".to_string(), Region::Udlandet),
        ]);
        assert_eq!(lookup.resolve("Viby J").map(|(_, r)| r), Some(Region::Sjaelland));
        assert_eq!(lookup.resolve("Atlantis").map(|(_, r)| r), Some(Region::Udlandet));
    }

    #[test]
    fn region_names_round_trip_through_their_stored_form() {
        for region in Region::ALL {
            assert_eq!(region.as_str().parse::<Region>(), Ok(region));
        }
        assert_eq!(
            serde_json::to_string(&Region::SydOgSoenderjylland).unwrap(),
            "\"Syd- og Sønderjylland\""
        );
        assert!("Jylland".parse::<Region>().is_err());
    }
}
