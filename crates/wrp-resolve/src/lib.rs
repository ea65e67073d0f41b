//! Field normalization, grower-name resolution, and fuzzy identity clustering.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;
use wrp_core::{CanonicalName, UNKNOWN};

pub const CRATE_NAME: &str = "wrp-resolve";

/// Surname particles that glue to the token following them.
const SURNAME_PARTICLES: &[&str] = &[
    "van", "von", "de", "del", "da", "la", "le", "der", "den", "st", "ter", "ten", "mac", "mc",
    "o",
];

/// Generational suffixes dropped during parsing.
const GENERATION_SUFFIXES: &[&str] = &["jr", "sr", "ii", "iii", "iv"];

/// Strip thousands separators and whitespace, then parse. Empty or
/// unparsable input is `None`, never an error.
pub fn clean_numeric(value: Option<&str>) -> Option<f64> {
    let cleaned = value?.replace(',', "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Trim whitespace; absent or empty input becomes the `"Unknown"` sentinel.
pub fn clean_text(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => UNKNOWN.to_string(),
    }
}

/// Like [`clean_text`], but also removes `/` from site names before they
/// become join keys.
pub fn clean_site(value: Option<&str>) -> String {
    let cleaned = clean_text(value).replace('/', "");
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Uppercase the first letter of every alphabetic run, lowercase the rest.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_alpha = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(ch);
            prev_alpha = false;
        }
    }
    out
}

/// Resolve a raw grower name into its canonical form.
///
/// Total over arbitrary input: separators are flattened, digits dropped,
/// team names rewritten as `Team <name>`, individual names parsed into
/// `(surname, given)` components. Worst case the trimmed, title-cased input
/// comes back unchanged as the surname.
pub fn resolve(raw_name: &str) -> CanonicalName {
    let cleaned = preprocess(raw_name);
    if cleaned.is_empty() {
        return CanonicalName {
            surname_or_team: UNKNOWN.to_string(),
            given_name: String::new(),
            is_team: false,
        };
    }

    if cleaned
        .split_whitespace()
        .any(|t| t.eq_ignore_ascii_case("team"))
    {
        let remainder = cleaned
            .split_whitespace()
            .filter(|t| !t.eq_ignore_ascii_case("team") && !t.eq_ignore_ascii_case("the"))
            .collect::<Vec<_>>()
            .join(" ");
        let surname_or_team = if remainder.is_empty() {
            format!("Team {UNKNOWN}")
        } else {
            format!("Team {}", title_case(&remainder))
        };
        return CanonicalName {
            surname_or_team,
            given_name: String::new(),
            is_team: true,
        };
    }

    parse_person(&cleaned)
}

/// Replace `&`, `/`, `-` with spaces, drop digits, collapse whitespace.
fn preprocess(raw: &str) -> String {
    raw.chars()
        .map(|c| if matches!(c, '&' | '/' | '-') { ' ' } else { c })
        .filter(|c| !c.is_ascii_digit())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_person(name: &str) -> CanonicalName {
    // An explicit "Last, First" form wins outright.
    if let Some((last, first)) = name.split_once(',') {
        let last = last.trim();
        if !last.is_empty() {
            return CanonicalName {
                surname_or_team: title_case(last),
                given_name: title_case(first.trim()),
                is_team: false,
            };
        }
    }

    let mut tokens: Vec<&str> = name
        .split_whitespace()
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .collect();
    while tokens.len() > 1 && is_generation_suffix(tokens[tokens.len() - 1]) {
        tokens.pop();
    }

    match tokens.len() {
        0 => CanonicalName {
            surname_or_team: title_case(name.trim()),
            given_name: String::new(),
            is_team: false,
        },
        1 => CanonicalName {
            surname_or_team: title_case(tokens[0]),
            given_name: String::new(),
            is_team: false,
        },
        _ => {
            let mut split = tokens.len() - 1;
            while split > 0 && is_surname_particle(tokens[split - 1]) {
                split -= 1;
            }
            CanonicalName {
                surname_or_team: title_case(&tokens[split..].join(" ")),
                given_name: title_case(&tokens[..split].join(" ")),
                is_team: false,
            }
        }
    }
}

fn normalized_token(token: &str) -> String {
    token.trim_matches('.').to_ascii_lowercase()
}

fn is_generation_suffix(token: &str) -> bool {
    GENERATION_SUFFIXES.contains(&normalized_token(token).as_str())
}

fn is_surname_particle(token: &str) -> bool {
    SURNAME_PARTICLES.contains(&normalized_token(token).as_str())
}

/// Order-independent token similarity in `[0.0, 100.0]`.
///
/// Tokens are lowercased, sorted, and rejoined before scoring, so
/// `"Smith, John"` and `"JOHN SMITH"` compare at 100. Symmetric by
/// construction.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&sorted_tokens(a), &sorted_tokens(b)) * 100.0
}

fn sorted_tokens(s: &str) -> String {
    let lowered = s.to_lowercase();
    let mut tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Thresholds for the two clustering passes. Both are exclusive lower
/// bounds: a pair links only when its score is strictly greater.
#[derive(Debug, Clone, Copy)]
pub struct ClusterParams {
    pub regional_threshold: f64,
    pub global_threshold: f64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            regional_threshold: 85.0,
            global_threshold: 90.0,
        }
    }
}

struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    // Always hang the larger root under the smaller, so a component's root
    // stays its lexicographically smallest member (names are index-sorted).
    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Collapse near-duplicate canonical names into a name → representative map.
///
/// Observations are `(canonical name, region)` pairs for every row in the
/// partition. Pass 1 links pairs above the regional threshold within each
/// region; pass 2 links pairs above the stricter global threshold, but only
/// among names that no regional cluster claimed. The representative of each
/// cluster is its lexicographically smallest member, which makes the output
/// independent of input order.
pub fn cluster_names(
    observations: &[(String, String)],
    params: ClusterParams,
) -> BTreeMap<String, String> {
    let unique: BTreeSet<&str> = observations.iter().map(|(name, _)| name.as_str()).collect();
    let names: Vec<&str> = unique.into_iter().collect();
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let mut regions: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();
    for (name, region) in observations {
        regions
            .entry(region.as_str())
            .or_default()
            .insert(index[name.as_str()]);
    }

    let mut dsu = Dsu::new(names.len());

    for members in regions.values() {
        let members: Vec<usize> = members.iter().copied().collect();
        for (pos, &i) in members.iter().enumerate() {
            for &j in &members[pos + 1..] {
                if token_sort_ratio(names[i], names[j]) > params.regional_threshold {
                    dsu.union(i, j);
                }
            }
        }
    }

    let mut component_size = vec![0usize; names.len()];
    for i in 0..names.len() {
        let root = dsu.find(i);
        component_size[root] += 1;
    }
    let mut in_regional_cluster = vec![false; names.len()];
    for i in 0..names.len() {
        let root = dsu.find(i);
        in_regional_cluster[i] = component_size[root] >= 2;
    }

    let unresolved: Vec<usize> = (0..names.len())
        .filter(|&i| !in_regional_cluster[i])
        .collect();
    for (pos, &i) in unresolved.iter().enumerate() {
        for &j in &unresolved[pos + 1..] {
            if token_sort_ratio(names[i], names[j]) > params.global_threshold {
                dsu.union(i, j);
            }
        }
    }

    let mut mapping = BTreeMap::new();
    let mut rewritten = 0usize;
    for (i, name) in names.iter().enumerate() {
        let root = dsu.find(i);
        if root != i {
            rewritten += 1;
        }
        mapping.insert((*name).to_string(), names[root].to_string());
    }
    debug!(
        names = names.len(),
        rewritten, "identity clustering finished"
    );
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_cleaning_strips_separators_and_rejects_garbage() {
        assert_eq!(clean_numeric(Some("1,234.5")), Some(1234.5));
        assert_eq!(clean_numeric(Some(" 42 ")), Some(42.0));
        assert_eq!(clean_numeric(Some("n/a")), None);
        assert_eq!(clean_numeric(Some("")), None);
        assert_eq!(clean_numeric(Some("   ")), None);
        assert_eq!(clean_numeric(None), None);
    }

    #[test]
    fn text_cleaning_substitutes_the_sentinel() {
        assert_eq!(clean_text(Some("  Anamosa ")), "Anamosa");
        assert_eq!(clean_text(Some("")), UNKNOWN);
        assert_eq!(clean_text(Some("   ")), UNKNOWN);
        assert_eq!(clean_text(None), UNKNOWN);
    }

    #[test]
    fn site_cleaning_drops_slashes() {
        assert_eq!(clean_site(Some("Elk Grove/ CA")), "Elk Grove CA");
        assert_eq!(clean_site(Some("///")), UNKNOWN);
        assert_eq!(clean_site(None), UNKNOWN);
    }

    #[test]
    fn title_case_follows_source_convention() {
        assert_eq!(title_case("JOHN SMITH"), "John Smith");
        assert_eq!(title_case("mcdonald"), "Mcdonald");
        assert_eq!(title_case("o'brien"), "O'Brien");
    }

    #[test]
    fn resolve_parses_individuals() {
        let c = resolve("Smith, John");
        assert_eq!(c.surname_or_team, "Smith");
        assert_eq!(c.given_name, "John");
        assert!(!c.is_team);
        assert_eq!(c.render(), "Smith, John");

        assert_eq!(resolve("JOHN SMITH").render(), "Smith, John");
        assert_eq!(resolve("John Smith Jr.").render(), "Smith, John");
        assert_eq!(resolve("Vincent van Gogh").render(), "Van Gogh, Vincent");
        assert_eq!(resolve("Mary-Jane Smith").render(), "Smith, Mary Jane");
    }

    #[test]
    fn resolve_handles_teams() {
        let c = resolve("The Johnson Team");
        assert!(c.is_team);
        assert_eq!(c.surname_or_team, "Team Johnson");
        assert_eq!(c.render(), "Team Johnson");

        assert_eq!(resolve("team").surname_or_team, "Team Unknown");
        assert_eq!(resolve("Team Pumpkin & Friends").render(), "Team Pumpkin Friends");
    }

    #[test]
    fn resolve_is_total_and_degrades_gracefully() {
        assert_eq!(resolve("").surname_or_team, UNKNOWN);
        assert_eq!(resolve("   ").surname_or_team, UNKNOWN);
        assert_eq!(resolve("1234").surname_or_team, UNKNOWN);
        // No parsable surname: the trimmed, title-cased input comes back.
        assert_eq!(resolve("@@@").surname_or_team, "@@@");
        assert_eq!(resolve("Cher").render(), "Cher");
    }

    #[test]
    fn resolve_is_idempotent_on_its_own_render() {
        for raw in [
            "Smith, John",
            "JOHN SMITH",
            "The Johnson Team",
            "Vincent van Gogh",
            "Mike O'Brien",
            "Cher",
            "",
            "John Smith Jr.",
        ] {
            let once = resolve(raw);
            assert_eq!(resolve(&once.render()), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn ratio_is_symmetric_and_order_independent() {
        assert_eq!(
            token_sort_ratio("Smith, John", "JOHN SMITH"),
            100.0
        );
        let a = token_sort_ratio("Smith, John", "Smith, Jon");
        let b = token_sort_ratio("Smith, Jon", "Smith, John");
        assert_eq!(a, b);
        assert!(a > 85.0 && a <= 90.0, "expected borderline score, got {a}");
    }

    fn obs(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, r)| (n.to_string(), r.to_string()))
            .collect()
    }

    #[test]
    fn regional_pair_above_threshold_shares_a_representative() {
        let observations = obs(&[
            ("Smith, John", "Iowa"),
            ("Smith, Jon", "Iowa"),
            ("Wallace, Ron", "Rhode Island"),
        ]);
        let mapping = cluster_names(&observations, ClusterParams::default());
        // Lexicographically smallest member wins.
        assert_eq!(mapping["Smith, John"], "Smith, John");
        assert_eq!(mapping["Smith, Jon"], "Smith, John");
        assert_eq!(mapping["Wallace, Ron"], "Wallace, Ron");
    }

    #[test]
    fn borderline_pair_does_not_cross_regions() {
        // Score 90 clears the regional bar but not the strict global one.
        let observations = obs(&[("Smith, John", "Iowa"), ("Smith, Jon", "Ohio")]);
        let mapping = cluster_names(&observations, ClusterParams::default());
        assert_eq!(mapping["Smith, John"], "Smith, John");
        assert_eq!(mapping["Smith, Jon"], "Smith, Jon");
    }

    #[test]
    fn exact_match_crosses_regions_in_the_global_pass() {
        let observations = obs(&[("Smith  John", "Iowa"), ("JOHN SMITH", "Ohio")]);
        let mapping = cluster_names(&observations, ClusterParams::default());
        assert_eq!(mapping["Smith  John"], mapping["JOHN SMITH"]);
        assert_eq!(mapping["JOHN SMITH"], "JOHN SMITH");
    }

    #[test]
    fn regionally_clustered_names_are_frozen_for_the_global_pass() {
        let observations = obs(&[
            ("Johnson, Kevin", "Iowa"),
            ("Johnson, Kevan", "Iowa"),
            ("Johnson Kevin", "Ohio"),
        ]);
        let mapping = cluster_names(&observations, ClusterParams::default());
        // The two Iowa spellings form a regional cluster.
        assert_eq!(mapping["Johnson, Kevin"], "Johnson, Kevan");
        // The Ohio name scores 100 against a clustered member, but members of
        // regional clusters are not reconsidered globally.
        assert_eq!(mapping["Johnson Kevin"], "Johnson Kevin");
    }

    #[test]
    fn clustering_is_deterministic_under_shuffled_input() {
        let forward = obs(&[
            ("Smith, John", "Iowa"),
            ("Smith, Jon", "Iowa"),
            ("Wallace, Ron", "Rhode Island"),
            ("Wallace, Rob", "Rhode Island"),
        ]);
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(
            cluster_names(&forward, ClusterParams::default()),
            cluster_names(&reversed, ClusterParams::default())
        );
    }

    #[test]
    fn end_to_end_scenario_from_raw_names() {
        // Two spellings of the same grower already normalize to one form.
        assert_eq!(resolve("Smith, John").render(), resolve("JOHN SMITH").render());

        // A near-miss spelling still converges through regional clustering,
        // onto the lexicographically smaller rendered form.
        let a = resolve("Smyth, John").render();
        let b = resolve("JOHN SMITH").render();
        assert!(token_sort_ratio(&a, &b) > 85.0);
        let observations = obs(&[(&a, "Iowa"), (&b, "Iowa")]);
        let mapping = cluster_names(&observations, ClusterParams::default());
        assert_eq!(mapping[&a], "Smith, John");
        assert_eq!(mapping[&b], "Smith, John");
    }
}
