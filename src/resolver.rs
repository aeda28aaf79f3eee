//! Betting Market Outcome Resolver
//!
//! Classifies a free-text prediction against a final score. Input is
//! untrusted text written by humans or an upstream odds API ("Home -3.5",
//! "Over 2.5", "Match Winner: Boston Celtics", "dnb home", "Set Betting:
//! 2-0"). The resolver is total: anything outside the grammar yields
//! `Unresolved`, never an error. Callers log and skip — an unrecognized
//! prediction is retried on the next settlement pass.
//!
//! # Market Families
//!
//! Families are evaluated in a fixed, most-specific-first order; the first
//! family that claims a prediction is final and later families are never
//! consulted. See `FAMILIES` for the exact order. Per-family edge rules:
//!
//! - Double Chance: logical OR of two of {home win, draw, away win}
//! - Match Winner by name: exact then partial case-insensitive containment
//!   against team names, positional fallback (home/1, away/2, draw/x)
//! - Over/Under: strict `>` / `<` against the parsed line, never `>=`/`<=`
//!   (lines are .5 so a push cannot occur)
//! - Both Teams To Score: bare "btts" defaults to Yes
//! - Draw No Bet: draw voids the bet, otherwise a plain side bet
//! - Handicap: win iff `margin - line > 0` from the named side's
//!   perspective; a `+` in the text inverts the line sign
//! - Set Betting: order-agnostic, because score providers swap home/away
//!   ordering for racket sports
//! - Correct Score: exact, order-sensitive; runs last so looser families
//!   cannot shadow it
//!
//! # Determinism
//!
//! Pure function of its arguments. No clock, no randomness, no I/O.

/// Terminal classification of a prediction against a final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Won,
    Lost,
    Void,
    /// The prediction is outside the supported grammar. The owning leg
    /// stays pending until the grammar learns the market.
    Unresolved,
}

/// Normalized prediction plus every derived score fact the families need.
struct ScoreContext {
    pred: String,
    home_score: i64,
    away_score: i64,
    total: i64,
    home_win: bool,
    away_win: bool,
    draw: bool,
    both_scored: bool,
    /// Lowercased team/player names; empty when the caller has none.
    home_name: String,
    away_name: String,
}

type FamilyFn = fn(&ScoreContext) -> Option<Resolution>;

/// Ordered dispatch table. `None` from a family means "not my market,
/// try the next one"; `Some(..)` is final, including `Some(Unresolved)`.
const FAMILIES: &[(&str, FamilyFn)] = &[
    ("double_chance", double_chance),
    ("match_winner_named", match_winner_named),
    ("match_winner", match_winner),
    ("over_under", over_under),
    ("both_teams_to_score", both_teams_to_score),
    ("draw_no_bet", draw_no_bet),
    ("handicap", handicap),
    ("odd_even", odd_even),
    ("set_betting", set_betting),
    ("correct_score", correct_score),
];

/// Resolve a prediction against a final score.
pub fn resolve(
    prediction: &str,
    home_score: i64,
    away_score: i64,
    home_name: Option<&str>,
    away_name: Option<&str>,
) -> Resolution {
    let pred = prediction.trim().to_lowercase();
    if pred.is_empty() {
        return Resolution::Unresolved;
    }

    let ctx = ScoreContext {
        pred,
        home_score,
        away_score,
        total: home_score + away_score,
        home_win: home_score > away_score,
        away_win: away_score > home_score,
        draw: home_score == away_score,
        both_scored: home_score > 0 && away_score > 0,
        home_name: home_name.unwrap_or("").trim().to_lowercase(),
        away_name: away_name.unwrap_or("").trim().to_lowercase(),
    };

    for (_family, check) in FAMILIES {
        if let Some(res) = check(&ctx) {
            return res;
        }
    }
    Resolution::Unresolved
}

fn win_or_lose(won: bool) -> Option<Resolution> {
    Some(if won { Resolution::Won } else { Resolution::Lost })
}

// =============================================================================
// MARKET FAMILIES (in evaluation order)
// =============================================================================

fn double_chance(c: &ScoreContext) -> Option<Resolution> {
    let p = &c.pred;

    // Positional forms. Token match, not substring, so "over 120.5" can
    // never be mistaken for a "12" double chance.
    if has_token(p, "12")
        || p.contains("home_away")
        || p.contains("home or away")
        || p.contains("home/away")
    {
        return win_or_lose(c.home_win || c.away_win);
    }
    if has_token(p, "1x")
        || p.contains("home_draw")
        || p.contains("home or draw")
        || p.contains("home/draw")
        || p.contains("draw/home")
    {
        return win_or_lose(c.home_win || c.draw);
    }
    if has_token(p, "x2")
        || p.contains("draw_away")
        || p.contains("draw or away")
        || p.contains("draw/away")
        || p.contains("away/draw")
    {
        return win_or_lose(c.away_win || c.draw);
    }

    // Team-name forms, e.g. "Santos or Draw"
    if !c.home_name.is_empty()
        && (p.contains(&format!("{} or draw", c.home_name))
            || p.contains(&format!("{}_draw", c.home_name))
            || p.contains(&format!("{} or x", c.home_name)))
    {
        return win_or_lose(c.home_win || c.draw);
    }
    if !c.away_name.is_empty()
        && (p.contains(&format!("{} or draw", c.away_name))
            || p.contains(&format!("draw or {}", c.away_name)))
    {
        return win_or_lose(c.away_win || c.draw);
    }
    if !c.home_name.is_empty()
        && !c.away_name.is_empty()
        && (p.contains(&format!("{} or {}", c.home_name, c.away_name))
            || p.contains(&format!("{}_{}", c.home_name, c.away_name)))
    {
        return win_or_lose(c.home_win || c.away_win);
    }

    // Catch-alls for "<something> or draw" where <something> is a partial
    // team name the caller didn't give us. When both sides are mentioned,
    // whichever appears later wins the ambiguity.
    if (p.contains(" or draw") || p.contains(" or x")) && !p.contains("away") {
        return win_or_lose(c.home_win || c.draw);
    }
    if p.contains(" or draw") || p.contains("draw or ") || p.contains("x or ") {
        let favors_away = match (p.find("home"), p.find("away")) {
            (None, _) => true,
            (Some(h), Some(a)) => h > a,
            (Some(_), None) => false,
        };
        if favors_away {
            return win_or_lose(c.away_win || c.draw);
        }
    }

    None
}

fn match_winner_named(c: &ScoreContext) -> Option<Resolution> {
    let picked = c.pred.strip_prefix("match winner:")?.trim();
    if picked.is_empty() {
        return Some(Resolution::Unresolved);
    }

    if !c.home_name.is_empty() && picked == c.home_name {
        return win_or_lose(c.home_win);
    }
    if !c.away_name.is_empty() && picked == c.away_name {
        return win_or_lose(c.away_win);
    }
    // Partial containment either way: "Pelicans" vs "New Orleans Pelicans"
    if !c.home_name.is_empty() && (c.home_name.contains(picked) || picked.contains(&c.home_name)) {
        return win_or_lose(c.home_win);
    }
    if !c.away_name.is_empty() && (c.away_name.contains(picked) || picked.contains(&c.away_name)) {
        return win_or_lose(c.away_win);
    }

    match picked {
        "home" | "1" => win_or_lose(c.home_win),
        "away" | "2" => win_or_lose(c.away_win),
        "draw" | "x" => win_or_lose(c.draw),
        _ => Some(Resolution::Unresolved),
    }
}

fn match_winner(c: &ScoreContext) -> Option<Resolution> {
    match c.pred.as_str() {
        "home" | "1" | "home win" => win_or_lose(c.home_win),
        "away" | "2" | "away win" => win_or_lose(c.away_win),
        "draw" | "x" => win_or_lose(c.draw),
        _ => None,
    }
}

fn over_under(c: &ScoreContext) -> Option<Resolution> {
    if let Some(line) = number_after(&c.pred, "over") {
        return win_or_lose(c.total as f64 > line);
    }
    if let Some(line) = number_after(&c.pred, "under") {
        return win_or_lose((c.total as f64) < line);
    }
    // Legacy compact spellings
    if c.pred == "over25" {
        return win_or_lose(c.total as f64 > 2.5);
    }
    if c.pred == "under25" {
        return win_or_lose((c.total as f64) < 2.5);
    }
    None
}

fn both_teams_to_score(c: &ScoreContext) -> Option<Resolution> {
    let p = &c.pred;
    if p.contains("btts") && p.contains("no") {
        return win_or_lose(!c.both_scored);
    }
    // Bare "btts" defaults to Yes
    if p.contains("btts") || (p.contains("both teams") && p.contains("yes")) {
        return win_or_lose(c.both_scored);
    }
    if p.contains("both teams") && p.contains("no") {
        return win_or_lose(!c.both_scored);
    }
    None
}

fn draw_no_bet(c: &ScoreContext) -> Option<Resolution> {
    let p = &c.pred;
    if !(p.contains("draw no bet") || p.contains("draw_no_bet") || p.contains("dnb")) {
        return None;
    }
    if c.draw {
        return Some(Resolution::Void);
    }
    let names_home = !c.home_name.is_empty()
        && p.contains(&c.home_name)
        && (c.away_name.is_empty() || !p.contains(&c.away_name));
    let names_away = !c.away_name.is_empty()
        && p.contains(&c.away_name)
        && (c.home_name.is_empty() || !p.contains(&c.home_name));
    if p.contains("home") || names_home {
        return win_or_lose(c.home_win);
    }
    if p.contains("away") || names_away {
        return win_or_lose(c.away_win);
    }
    Some(Resolution::Unresolved)
}

fn handicap(c: &ScoreContext) -> Option<Resolution> {
    // "Home -3.5" needs home to win by more than 3.5; "Home +2.5" lets
    // home lose by up to 2.5. Keyword sides first, then team names.
    let home_margin = (c.home_score - c.away_score) as f64;
    for (key, margin) in [("home", home_margin), ("away", -home_margin)] {
        if let Some(line) = signed_line_after(&c.pred, key) {
            return win_or_lose(margin - line > 0.0);
        }
    }
    for (name, margin) in [(&c.home_name, home_margin), (&c.away_name, -home_margin)] {
        if name.is_empty() {
            continue;
        }
        if let Some(line) = signed_line_after(&c.pred, name) {
            return win_or_lose(margin - line > 0.0);
        }
    }
    None
}

fn odd_even(c: &ScoreContext) -> Option<Resolution> {
    let p = &c.pred;
    let claimed = p == "odd" || p == "even" || p.contains("odd total") || p.contains("even total");
    if !claimed {
        return None;
    }
    let want_odd = p.contains("odd");
    win_or_lose((c.total % 2 == 1) == want_odd)
}

fn set_betting(c: &ScoreContext) -> Option<Resolution> {
    if !(c.pred.contains("set betting") || c.pred.contains("setbetting")) {
        return None;
    }
    let (a, b) = score_pair(&c.pred)?;
    // Order-agnostic: providers swap home/away identity of set scores
    let (h, w) = (c.home_score, c.away_score);
    win_or_lose((h == a && w == b) || (h == b && w == a))
}

fn correct_score(c: &ScoreContext) -> Option<Resolution> {
    let (a, b) = score_pair(&c.pred)?;
    win_or_lose(a == c.home_score && b == c.away_score)
}

// =============================================================================
// TEXT HELPERS
// =============================================================================

/// True when `token` appears as a standalone alphanumeric token.
fn has_token(pred: &str, token: &str) -> bool {
    pred.split(|ch: char| !ch.is_ascii_alphanumeric())
        .any(|t| t == token)
}

/// Parse the number directly following `key`, e.g. "over 2.5" -> 2.5.
fn number_after(pred: &str, key: &str) -> Option<f64> {
    let idx = pred.find(key)?;
    let rest = pred[idx + key.len()..].trim_start();
    let end = rest
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse().ok()
}

/// Parse a signed handicap line directly following `key`.
/// "-3.5" keeps the line positive; "+2.5" inverts it to -2.5.
fn signed_line_after(pred: &str, key: &str) -> Option<f64> {
    let idx = pred.find(key)?;
    let rest = pred[idx + key.len()..].trim_start();
    let sign = rest.chars().next()?;
    if sign != '+' && sign != '-' {
        return None;
    }
    let rest = rest[1..].trim_start();
    let end = rest
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    let num: f64 = rest[..end].parse().ok()?;
    Some(if sign == '-' { num } else { -num })
}

/// First "A-B" or "A:B" integer pair in the text, e.g. "2-1" or "2 : 0".
fn score_pair(pred: &str) -> Option<(i64, i64)> {
    let bytes = pred.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let mut j = i;
        while j < bytes.len() && bytes[j] == b' ' {
            j += 1;
        }
        if j < bytes.len() && (bytes[j] == b'-' || bytes[j] == b':') {
            j += 1;
            while j < bytes.len() && bytes[j] == b' ' {
                j += 1;
            }
            let second_start = j;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > second_start {
                let first = pred[start..i].parse().ok()?;
                let second = pred[second_start..j].parse().ok()?;
                return Some((first, second));
            }
        }
    }
    None
}

// =============================================================================
// TESTS
// =============================================================================
