//! Country codes accepted by the upstream gateway

/// Two-letter country codes the gateway can geolocate exits to
pub const SUPPORTED_COUNTRIES: &[&str] = &[
    "ae", "al", "am", "ao", "ar", "at", "au", "az", "ba", "bb", "bd", "be", "bf", "bg", "bh",
    "bj", "bn", "bo", "br", "bw", "by", "bz", "ca", "ch", "ci", "cl", "cm", "cn", "co", "cr",
    "cu", "cw", "cy", "cz", "de", "dk", "dm", "do", "dz", "ec", "ee", "eg", "es", "et", "fi",
    "fr", "ga", "gb", "ge", "gh", "gr", "gt", "gy", "hk", "hn", "hr", "ht", "hu", "id", "ie",
    "il", "in", "iq", "ir", "is", "it", "jm", "jo", "jp", "ke", "kg", "kh", "kr", "kw", "kz",
    "la", "lb", "lc", "lk", "ls", "lt", "lu", "lv", "ly", "ma", "md", "me", "mg", "mk", "ml",
    "mm", "mn", "mo", "mt", "mu", "mv", "mw", "mx", "my", "mz", "na", "ng", "ni", "nl", "no",
    "np", "nz", "om", "pa", "pe", "ph", "pk", "pl", "pr", "ps", "pt", "py", "qa", "re", "ro",
    "rs", "ru", "rw", "se", "sg", "si", "sk", "sn", "so", "sr", "sv", "sy", "tg", "th", "tj",
    "tn", "tr", "tt", "tw", "tz", "ua", "ug", "us", "uy", "uz", "ve", "vn", "za", "zm", "zw",
];

/// Check whether a country code is supported
#[must_use]
pub fn is_supported_country(code: &str) -> bool {
    SUPPORTED_COUNTRIES.binary_search(&code).is_ok()
}
