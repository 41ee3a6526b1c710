//! Word lists for generated worker names.

pub(crate) const ADJECTIVES: &[&str] = &[
    "able", "agile", "amber", "ample", "apt", "bold", "brave", "brisk", "calm", "civil",
    "clean", "clear", "clever", "cool", "cosmic", "crisp", "curious", "daring", "deep", "eager",
    "early", "easy", "epic", "fair", "fast", "fine", "firm", "fleet", "fluent", "fond",
    "frank", "fresh", "gentle", "giving", "glad", "golden", "grand", "happy", "hardy", "hearty",
    "honest", "humble", "ideal", "jolly", "just", "keen", "kind", "lively", "loyal", "lucid",
    "lucky", "magic", "merry", "mighty", "modest", "neat", "nimble", "noble", "open", "patient",
    "plucky", "polite", "proud", "quick", "quiet", "rapid", "ready", "regal", "robust", "rosy",
    "sharp", "shiny", "silent", "sleek", "smart", "smooth", "snappy", "solid", "sound", "spry",
    "steady", "stoic", "sturdy", "sunny", "super", "swift", "tender", "tidy", "tough", "true",
    "upbeat", "usable", "valid", "vital", "vivid", "warm", "wise", "witty", "zany", "zesty",
];

pub(crate) const NOUNS: &[&str] = &[
    "alpaca", "badger", "beagle", "bison", "bobcat", "camel", "caribou", "cheetah", "chipmunk", "cobra",
    "condor", "cougar", "coyote", "crane", "cricket", "dingo", "dolphin", "donkey", "eagle", "egret",
    "elk", "falcon", "ferret", "finch", "gazelle", "gecko", "gibbon", "gopher", "grouse", "gull",
    "hamster", "hare", "hawk", "hedgehog", "heron", "hornet", "husky", "ibex", "iguana", "impala",
    "jackal", "jaguar", "kestrel", "kite", "koala", "lemur", "leopard", "lion", "llama", "lynx",
    "macaw", "magpie", "mako", "mantis", "marlin", "marmot", "marten", "mink", "mole", "moose",
    "newt", "ocelot", "octopus", "oriole", "osprey", "otter", "owl", "panda", "panther", "parrot",
    "pelican", "penguin", "puffin", "puma", "quail", "rabbit", "raven", "robin", "salmon", "seal",
    "shark", "sloth", "snail", "sparrow", "squid", "stork", "swan", "tapir", "tiger", "toucan",
    "trout", "turtle", "viper", "walrus", "weasel", "whale", "wolf", "wombat", "yak", "zebra",
];
