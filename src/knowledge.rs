//! Per-game reference material for the model passes.
//!
//! Each entry carries a short guide to the on-screen HUD (so the model can
//! tell the subject's own view from spectator footage and read resources off
//! the screen) and a strategy reference the coaching tips are judged against.
//! Looked up by the dataset's `game` field.

use std::fmt::Write as _;

#[derive(Debug)]
pub struct GameKnowledge {
    /// Canonical game id, as written by the replay parsers.
    pub game: &'static str,
    aliases: &'static [&'static str],
    pub hud: &'static str,
    pub strategy: &'static str,
}

impl GameKnowledge {
    fn matches(&self, game: &str) -> bool {
        self.game == game || self.aliases.contains(&game)
    }
}

static CS2: GameKnowledge = GameKnowledge {
    game: "cs2",
    aliases: &["csgo", "cs", "counter-strike", "counter-strike 2"],
    hud: "\
- Bottom left: health and armor. Bottom right: equipped weapon and ammo. Money is shown next to \
the buy menu and at round start.
- Top centre: round timer and score. Once the bomb is planted the timer is replaced by the bomb icon.
- Top right: kill feed. The subject's kills and death appear there with their name highlighted.
- Top left: radar with teammates as dots and spotted enemies in red.
- After the subject dies the screen shows another player's name at the bottom with a spectating \
banner. Nothing seen from that point on reflects the subject's play.",
    strategy: "\
Economy:
- Full buy (rifle, armor, utility) needs roughly $4750; below about $2000 teams usually save.
- Loss bonus grows with consecutive losses ($1400 up to $3400). Breaking it with an early force \
often costs two later rounds.
- Force buying straight after winning the pistol round, or buying alone while the team saves, are \
common leaks.

Utility:
- Flash before peeking a held angle; a pop flash that detonates as it clears the wall is best.
- Smokes cut crossings and lines of sight, molotovs clear close corners and stop rushes.
- Dying with unused grenades, or throwing everything in the first seconds, are recurring mistakes.

Aim and movement:
- Keep the crosshair at head height on the next angle to be cleared, adjusted for stairs and boxes.
- Counter-strafe to stand still before firing; shooting while moving with a rifle is inaccurate.
- Clear one angle at a time instead of wide-swinging into several.

Positioning and trading:
- A second player should be close enough to trade an entry within one or two seconds.
- Re-peeking the same angle after getting a kill, or holding the same spot every round, is \
predictable.
- After the bomb is down, post-plant positions should cross-fire the bomb, not stack one angle.",
};

static AOE2: GameKnowledge = GameKnowledge {
    game: "aoe2",
    aliases: &["aoe2de", "age of empires ii", "age of empires 2", "age2"],
    hud: "\
- Top left: wood, food, gold and stone stockpiles, population (current/limit) and the current age.
- The idle villager button sits next to the minimap; a number on it means villagers are idle.
- Bottom: selected unit or building panel with its production queue and research.
- Bottom right: minimap. Player colours show territory and armies.
- The in-game clock runs faster than real time, so on-screen time and video time differ.",
    strategy: "\
Dark Age:
- Constant villager production from the town centre is the single biggest economic factor; any \
idle town centre time is lost economy.
- Houses must be built ahead of the population limit. Being housed stalls production.
- Sheep under the town centre first, then boar lures, then berries and farms.

Transitions:
- Typical Feudal Age click is around 9 to 10 in-game minutes for standard builds, Castle Age \
around 16 to 20.
- Economy upgrades (double-bit axe, horse collar, wheelbarrow) should follow each age-up.

Military:
- Counters follow a loop: spearmen beat cavalry, archers beat spearmen, skirmishers beat archers, \
cavalry beats archers and siege.
- Scouting the opponent early decides which counter to build. Reacting late to a switch is a \
common loss cause.
- Armies left idle at home while the opponent raids, or sent without upgrades, waste resources.

Macro:
- Spend resources as they come in; a large unspent bank means production is too low.
- Keep adding production buildings as the economy grows and keep them working.",
};

static ALL: [&GameKnowledge; 2] = [&CS2, &AOE2];

/// Reference material for `game`, matched case-insensitively against the
/// canonical id and known aliases.
pub fn lookup(game: &str) -> Option<&'static GameKnowledge> {
    let game = game.trim().to_ascii_lowercase();
    ALL.iter().copied().find(|k| k.matches(&game))
}

/// The `{knowledge}` block for prompts.
pub fn render_knowledge(game: &str) -> String {
    let Some(knowledge) = lookup(game) else {
        return "<game_knowledge>\nNo game-specific reference is available. Judge the play on \
general fundamentals visible in the video.\n</game_knowledge>"
            .to_string();
    };
    let mut out = String::new();
    let _ = writeln!(out, "<game_knowledge game=\"{}\">", knowledge.game);
    let _ = writeln!(out, "Reading the screen:\n{}\n", knowledge.hud);
    let _ = writeln!(out, "Strategy reference:\n{}", knowledge.strategy);
    out.push_str("</game_knowledge>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_game() {
        assert_eq!(lookup(" CSGO ").map(|k| k.game), Some("cs2"));
        assert_eq!(lookup("Age of Empires II").map(|k| k.game), Some("aoe2"));
        assert!(lookup("chess").is_none());
    }

    #[test]
    fn rendered_block_carries_hud_and_strategy() {
        let text = render_knowledge("cs2");
        assert!(text.starts_with("<game_knowledge game=\"cs2\">"));
        assert!(text.contains("Reading the screen:"));
        assert!(text.contains("spectating"));
        assert!(text.contains("Strategy reference:"));
        assert!(text.ends_with("</game_knowledge>"));

        let unknown = render_knowledge("chess");
        assert!(unknown.contains("No game-specific reference"));
    }
}
