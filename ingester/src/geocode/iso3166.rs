//! ISO 3166 code tables.
//!
//! Resolvers return free-text country and admin-1 names; these tables turn
//! them into the lowercase codes used in topics and columns. Both tables are
//! living artefacts: one row per mapping, extended as new localities show up
//! in the field. Names not present map to `unknown` at the call site.

/// ISO 3166-1 alpha-2, lowercase.
const COUNTRY_NAME_TO_ISO: &[(&str, &str)] = &[
    ("New Zealand", "nz"),
    ("Australia", "au"),
    ("United States", "us"),
    ("United States of America", "us"),
    ("United Kingdom", "gb"),
    ("Canada", "ca"),
    ("Germany", "de"),
    ("France", "fr"),
    ("Netherlands", "nl"),
    ("Belgium", "be"),
    ("Switzerland", "ch"),
    ("Austria", "at"),
    ("Italy", "it"),
    ("Spain", "es"),
    ("Portugal", "pt"),
    ("Ireland", "ie"),
    ("Sweden", "se"),
    ("Norway", "no"),
    ("Denmark", "dk"),
    ("Finland", "fi"),
    ("Japan", "jp"),
    ("China", "cn"),
    ("Taiwan", "tw"),
    ("South Korea", "kr"),
    ("Singapore", "sg"),
    ("Malaysia", "my"),
    ("Thailand", "th"),
    ("Indonesia", "id"),
    ("Philippines", "ph"),
    ("India", "in"),
    ("Brazil", "br"),
    ("Mexico", "mx"),
    ("Argentina", "ar"),
    ("Chile", "cl"),
    ("South Africa", "za"),
    ("Poland", "pl"),
    ("Czech Republic", "cz"),
    ("Czechia", "cz"),
    ("Ukraine", "ua"),
    ("Belarus", "by"),
    ("Russia", "ru"),
];

/// ISO 3166-2 subdivision codes, lowercase, without the country prefix.
/// Keyed by `(country_code, admin1_name)`.
const SUBDIVISION_NAME_TO_ISO: &[(&str, &str, &str)] = &[
    // New Zealand
    ("nz", "Auckland", "auk"),
    ("nz", "Wellington", "wgn"),
    ("nz", "Canterbury", "can"),
    ("nz", "Otago", "ota"),
    ("nz", "Waikato", "wai"),
    ("nz", "Bay of Plenty", "bop"),
    ("nz", "Hawke's Bay", "hkb"),
    ("nz", "Manawatu-Wanganui", "mwt"),
    ("nz", "Northland", "ntl"),
    ("nz", "Taranaki", "tki"),
    ("nz", "Southland", "stl"),
    ("nz", "Tasman", "tas"),
    ("nz", "Nelson", "nsn"),
    ("nz", "Marlborough", "mbh"),
    ("nz", "West Coast", "wtc"),
    ("nz", "Gisborne", "gis"),
    // Australia
    ("au", "New South Wales", "nsw"),
    ("au", "Queensland", "qld"),
    ("au", "Victoria", "vic"),
    ("au", "Western Australia", "wa"),
    ("au", "South Australia", "sa"),
    ("au", "Tasmania", "tas"),
    ("au", "Northern Territory", "nt"),
    ("au", "Australian Capital Territory", "act"),
    // United States
    ("us", "Alabama", "al"),
    ("us", "Alaska", "ak"),
    ("us", "Arizona", "az"),
    ("us", "Arkansas", "ar"),
    ("us", "California", "ca"),
    ("us", "Colorado", "co"),
    ("us", "Connecticut", "ct"),
    ("us", "Delaware", "de"),
    ("us", "Florida", "fl"),
    ("us", "Georgia", "ga"),
    ("us", "Hawaii", "hi"),
    ("us", "Idaho", "id"),
    ("us", "Illinois", "il"),
    ("us", "Indiana", "in"),
    ("us", "Iowa", "ia"),
    ("us", "Kansas", "ks"),
    ("us", "Kentucky", "ky"),
    ("us", "Louisiana", "la"),
    ("us", "Maine", "me"),
    ("us", "Maryland", "md"),
    ("us", "Massachusetts", "ma"),
    ("us", "Michigan", "mi"),
    ("us", "Minnesota", "mn"),
    ("us", "Mississippi", "ms"),
    ("us", "Missouri", "mo"),
    ("us", "Montana", "mt"),
    ("us", "Nebraska", "ne"),
    ("us", "Nevada", "nv"),
    ("us", "New Hampshire", "nh"),
    ("us", "New Jersey", "nj"),
    ("us", "New Mexico", "nm"),
    ("us", "New York", "ny"),
    ("us", "North Carolina", "nc"),
    ("us", "North Dakota", "nd"),
    ("us", "Ohio", "oh"),
    ("us", "Oklahoma", "ok"),
    ("us", "Oregon", "or"),
    ("us", "Pennsylvania", "pa"),
    ("us", "Rhode Island", "ri"),
    ("us", "South Carolina", "sc"),
    ("us", "South Dakota", "sd"),
    ("us", "Tennessee", "tn"),
    ("us", "Texas", "tx"),
    ("us", "Utah", "ut"),
    ("us", "Vermont", "vt"),
    ("us", "Virginia", "va"),
    ("us", "Washington", "wa"),
    ("us", "West Virginia", "wv"),
    ("us", "Wisconsin", "wi"),
    ("us", "Wyoming", "wy"),
    ("us", "District of Columbia", "dc"),
    // United Kingdom
    ("gb", "England", "eng"),
    ("gb", "Scotland", "sct"),
    ("gb", "Wales", "wls"),
    ("gb", "Northern Ireland", "nir"),
    // Canada
    ("ca", "Ontario", "on"),
    ("ca", "Quebec", "qc"),
    ("ca", "British Columbia", "bc"),
    ("ca", "Alberta", "ab"),
    ("ca", "Manitoba", "mb"),
    ("ca", "Saskatchewan", "sk"),
    ("ca", "Nova Scotia", "ns"),
    ("ca", "New Brunswick", "nb"),
    ("ca", "Newfoundland and Labrador", "nl"),
    ("ca", "Prince Edward Island", "pe"),
    ("ca", "Northwest Territories", "nt"),
    ("ca", "Yukon", "yt"),
    ("ca", "Nunavut", "nu"),
    // Germany
    ("de", "Bavaria", "by"),
    ("de", "Berlin", "be"),
    ("de", "Hamburg", "hh"),
    ("de", "Hesse", "he"),
    ("de", "North Rhine-Westphalia", "nw"),
    ("de", "Baden-Wurttemberg", "bw"),
    ("de", "Baden-Württemberg", "bw"),
    ("de", "Lower Saxony", "ni"),
    ("de", "Saxony", "sn"),
    ("de", "Brandenburg", "bb"),
    // Netherlands
    ("nl", "North Holland", "nh"),
    ("nl", "South Holland", "zh"),
    ("nl", "Utrecht", "ut"),
    ("nl", "Gelderland", "ge"),
    ("nl", "North Brabant", "nb"),
    // France
    ("fr", "Ile-de-France", "idf"),
    ("fr", "Île-de-France", "idf"),
    ("fr", "Provence-Alpes-Cote d'Azur", "pac"),
    ("fr", "Occitanie", "occ"),
    ("fr", "Nouvelle-Aquitaine", "naq"),
    // Poland
    ("pl", "Masovian Voivodeship", "14"),
    ("pl", "Mazovia", "14"),
    ("pl", "Lesser Poland Voivodeship", "12"),
    // Japan
    ("jp", "Tokyo", "13"),
    ("jp", "Osaka", "27"),
    ("jp", "Hokkaido", "01"),
];

/// Country name -> ISO 3166-1 alpha-2 code.
pub fn country_code(name: &str) -> Option<&'static str> {
    COUNTRY_NAME_TO_ISO
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, c)| *c)
}

/// `(country_code, admin1_name)` -> ISO 3166-2 subdivision code.
pub fn subdivision_code(country: &str, admin1: &str) -> Option<&'static str> {
    SUBDIVISION_NAME_TO_ISO
        .iter()
        .find(|(c, n, _)| *c == country && n.eq_ignore_ascii_case(admin1))
        .map(|(_, _, s)| *s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_lookup() {
        assert_eq!(country_code("New Zealand"), Some("nz"));
        assert_eq!(country_code("united kingdom"), Some("gb"));
        assert_eq!(country_code("Atlantis"), None);
    }

    #[test]
    fn subdivision_lookup() {
        assert_eq!(subdivision_code("nz", "Auckland"), Some("auk"));
        assert_eq!(subdivision_code("gb", "England"), Some("eng"));
        assert_eq!(subdivision_code("us", "california"), Some("ca"));
        assert_eq!(subdivision_code("nz", "Narnia"), None);
        // Same name under the wrong country does not match.
        assert_eq!(subdivision_code("au", "Auckland"), None);
    }
}
