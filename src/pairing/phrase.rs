//! Challenge phrase generation
//!
//! Phrases are three words drawn from an embedded diceware-style list and
//! joined with hyphens. The phrase doubles as the coordination key for a
//! pairing attempt, so collisions between concurrent attempts must be
//! vanishingly rare; three words out of a few hundred give well over ten
//! million combinations, plenty for the handful of pairings in flight at
//! any moment.

use rand::seq::SliceRandom;

/// Number of words in a challenge phrase
pub const PHRASE_WORDS: usize = 3;

/// Embedded word list. Short, lowercase, unambiguous words that are easy to
/// read out loud and type on the other machine.
const WORDS: &[&str] = &[
    "acorn", "actor", "alarm", "album", "alien", "alley", "amber", "angle",
    "ankle", "anvil", "apple", "apron", "arrow", "atlas", "attic", "axiom",
    "bacon", "badge", "bagel", "banjo", "barn", "basil", "battery", "beach",
    "beacon",
    "beard", "beetle", "bell", "bench", "berry", "bison", "blade", "blanket",
    "blossom", "bolt", "bonnet", "book", "boot", "bottle", "boulder", "bow",
    "branch", "brass", "bread", "brick", "bridge", "brook", "broom", "brush",
    "bubble", "bucket", "bugle", "bundle", "butter", "button", "cabin",
    "cable", "cactus", "camel", "camera", "canal", "candle", "canoe",
    "canvas", "canyon", "carpet", "carrot", "castle", "cattle", "cedar",
    "cellar", "chair", "chalk", "cherry", "chess", "chest", "chime", "cider",
    "cinder", "circle", "citrus", "clay", "cliff", "clock", "cloud",
    "clover", "cobalt", "coffee", "comet", "copper", "coral", "correct",
    "cotton", "cradle", "crane", "crater", "crayon", "cricket", "crystal",
    "daisy", "deck", "delta", "desert", "diesel", "dinghy", "dome", "donkey",
    "door", "dragon", "drum", "dune", "eagle", "easel", "echo", "elbow",
    "elder", "ember", "engine", "fabric", "falcon", "feather", "fence",
    "fern", "ferry", "fiddle", "field", "finch", "flag", "flame", "flask",
    "flint", "flute", "forest", "fossil", "fountain", "fox", "frost",
    "galaxy", "garden", "garlic", "gate", "gazebo", "geyser", "ginger",
    "glacier", "glade", "glass", "globe", "glove", "goose", "granite",
    "grape", "gravel", "grove", "guitar", "hammer", "hamper", "harbor",
    "harvest", "hatch", "hawk", "hazel", "hedge", "helmet", "heron",
    "hickory", "hill", "hinge", "hollow", "honey", "hook", "horizon",
    "hornet", "horse", "hourglass", "husk", "igloo", "inlet", "iris",
    "island", "ivory", "jacket", "jasper", "jigsaw", "jungle", "juniper",
    "kayak", "kettle", "kiosk", "kitten", "knot", "ladder", "lagoon",
    "lantern", "larch", "laurel", "lava", "leaf", "ledge", "lemon", "lentil",
    "lever", "lilac", "lily", "linen", "lobby", "locket", "lotus", "lumber",
    "magnet", "mango", "mantle", "maple", "marble", "marsh", "mast",
    "meadow", "melon", "mesa", "mirror", "mitten", "monsoon", "moose",
    "morning", "mosaic", "moss", "moth", "mountain", "mulberry", "mural",
    "mustard", "napkin", "nectar", "nest", "nickel", "north", "notch",
    "nutmeg", "oak", "oasis", "obelisk", "ocean", "olive", "onyx", "orchard",
    "organ", "otter", "oyster", "paddle", "pagoda", "palm", "panda", "pansy",
    "pantry", "parcel", "parrot", "pasture", "peach", "pebble", "pelican",
    "pencil", "penny", "pepper", "petal", "pigeon", "pillar", "pillow",
    "pine", "pistol", "plank", "plateau", "plaza", "plum", "pocket", "pond",
    "poplar", "poppy", "porch", "prairie", "prism", "pumpkin", "quail",
    "quarry", "quartz", "quill", "quilt", "rabbit", "raft", "rail",
    "rainbow", "raisin", "ranch", "raven", "reef", "ribbon", "ridge",
    "river", "robin", "rocket", "rudder", "saddle", "saffron", "sage",
    "salmon", "sandal", "sapling", "satchel", "scarf", "school", "scooter",
    "sesame", "shadow", "shelf", "shell", "shingle", "shore", "shovel",
    "shrub", "signal", "silver", "sketch", "slate", "sleigh", "slope",
    "socket", "sparrow", "spice", "spiral", "spoon", "spring", "spruce",
    "squash", "stable", "stairs", "stamp", "steam", "stone", "stork",
    "stove", "stream", "summit", "sunset", "swan", "syrup", "tablet",
    "tailor", "talon", "tangerine", "tassel", "tavern", "teapot", "temple",
    "thicket", "thistle", "timber", "toad", "torch", "totem", "tractor",
    "trail", "tripod", "trout", "trumpet", "tulip", "tundra", "tunnel",
    "turnip", "turtle", "twig", "umbrella", "valley", "vault", "velvet",
    "vessel", "vine", "violet", "violin", "wagon", "walnut", "walrus",
    "wander", "wasp", "wharf", "wheat", "whisk", "willow", "window",
    "winter", "wolf", "wren", "yarn", "zebra", "zephyr", "zinc",
];

/// Generate a fresh three-word challenge phrase
#[must_use]
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    let words: Vec<&str> = (0..PHRASE_WORDS)
        .map(|_| *WORDS.choose(&mut rng).unwrap_or(&WORDS[0]))
        .collect();
    words.join("-")
}
