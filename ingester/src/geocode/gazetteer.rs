//! Offline nearest-city lookup.
//!
//! A compact gazetteer (one populated point per row with its country code
//! and admin-1 name) loaded into memory and scanned with haversine
//! distance. Linear scan over a few thousand rows stays well under the 5 ms
//! budget. A built-in set covering the networks' usual localities is always
//! available; `GAZETTEER_PATH` points at a larger CSV
//! (`name,lat,lon,country_code,admin1`) when the full dataset is deployed.
//!
//! Matches farther than the cutoff count as misses, so mid-ocean
//! coordinates (Null Island included) fall through to the online resolver
//! or to `unknown` instead of snapping to the nearest continent.

use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::info;

/// Beyond this distance the nearest point is not a plausible locality.
pub const MAX_MATCH_DISTANCE_KM: f64 = 300.0;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Clone, Debug)]
pub struct Place {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// ISO 3166-1 alpha-2, lowercase.
    pub country: String,
    /// Admin-1 name as used by the ISO mapping tables.
    pub admin1: String,
}

pub struct Gazetteer {
    places: Vec<Place>,
}

pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

impl Gazetteer {
    /// The compiled-in dataset.
    pub fn builtin() -> Self {
        let places = BUILTIN_PLACES
            .iter()
            .map(|&(name, lat, lon, cc, admin1)| Place {
                name: name.to_string(),
                latitude: lat,
                longitude: lon,
                country: cc.to_string(),
                admin1: admin1.to_string(),
            })
            .collect();
        Self { places }
    }

    /// Load `name,lat,lon,country_code,admin1` rows; `#` lines are comments.
    /// The built-in set is appended so sparse files never lose coverage.
    pub fn from_csv(path: &Path) -> anyhow::Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("reading gazetteer {}", path.display()))?;
        let mut g = Self::builtin();
        for (lineno, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() != 5 {
                anyhow::bail!("gazetteer line {}: expected 5 fields", lineno + 1);
            }
            g.places.push(Place {
                name: fields[0].to_string(),
                latitude: fields[1]
                    .trim()
                    .parse()
                    .with_context(|| format!("gazetteer line {}: latitude", lineno + 1))?,
                longitude: fields[2]
                    .trim()
                    .parse()
                    .with_context(|| format!("gazetteer line {}: longitude", lineno + 1))?,
                country: fields[3].trim().to_lowercase(),
                admin1: fields[4].trim().to_string(),
            });
        }
        info!(path = %path.display(), places = g.places.len(), "gazetteer_loaded");
        Ok(g)
    }

    /// Nearest place within the match cutoff.
    pub fn nearest(&self, lat: f64, lon: f64) -> Option<&Place> {
        self.places
            .iter()
            .map(|p| (haversine_km(lat, lon, p.latitude, p.longitude), p))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .filter(|(d, _)| *d <= MAX_MATCH_DISTANCE_KM)
            .map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }
}

/// name, lat, lon, country code, admin1 name.
const BUILTIN_PLACES: &[(&str, f64, f64, &str, &str)] = &[
    // New Zealand
    ("Auckland", -36.8485, 174.7633, "nz", "Auckland"),
    ("Hamilton", -37.7870, 175.2793, "nz", "Waikato"),
    ("Tauranga", -37.6878, 176.1651, "nz", "Bay of Plenty"),
    ("Napier", -39.4928, 176.9120, "nz", "Hawke's Bay"),
    ("New Plymouth", -39.0556, 174.0752, "nz", "Taranaki"),
    ("Palmerston North", -40.3523, 175.6082, "nz", "Manawatu-Wanganui"),
    ("Wellington", -41.2866, 174.7756, "nz", "Wellington"),
    ("Nelson", -41.2706, 173.2840, "nz", "Nelson"),
    ("Christchurch", -43.5321, 172.6362, "nz", "Canterbury"),
    ("Dunedin", -45.8788, 170.5028, "nz", "Otago"),
    ("Invercargill", -46.4132, 168.3538, "nz", "Southland"),
    ("Whangarei", -35.7251, 174.3237, "nz", "Northland"),
    ("Gisborne", -38.6623, 178.0176, "nz", "Gisborne"),
    ("Greymouth", -42.4504, 171.2108, "nz", "West Coast"),
    // Australia
    ("Sydney", -33.8688, 151.2093, "au", "New South Wales"),
    ("Melbourne", -37.8136, 144.9631, "au", "Victoria"),
    ("Brisbane", -27.4698, 153.0251, "au", "Queensland"),
    ("Perth", -31.9505, 115.8605, "au", "Western Australia"),
    ("Adelaide", -34.9285, 138.6007, "au", "South Australia"),
    ("Hobart", -42.8821, 147.3272, "au", "Tasmania"),
    ("Darwin", -12.4634, 130.8456, "au", "Northern Territory"),
    ("Canberra", -35.2809, 149.1300, "au", "Australian Capital Territory"),
    ("Cairns", -16.9186, 145.7781, "au", "Queensland"),
    ("Alice Springs", -23.6980, 133.8807, "au", "Northern Territory"),
    // United States
    ("New York", 40.7128, -74.0060, "us", "New York"),
    ("Los Angeles", 34.0522, -118.2437, "us", "California"),
    ("San Francisco", 37.7749, -122.4194, "us", "California"),
    ("Chicago", 41.8781, -87.6298, "us", "Illinois"),
    ("Houston", 29.7604, -95.3698, "us", "Texas"),
    ("Dallas", 32.7767, -96.7970, "us", "Texas"),
    ("Phoenix", 33.4484, -112.0740, "us", "Arizona"),
    ("Seattle", 47.6062, -122.3321, "us", "Washington"),
    ("Portland", 45.5152, -122.6784, "us", "Oregon"),
    ("Denver", 39.7392, -104.9903, "us", "Colorado"),
    ("Miami", 25.7617, -80.1918, "us", "Florida"),
    ("Atlanta", 33.7490, -84.3880, "us", "Georgia"),
    ("Boston", 42.3601, -71.0589, "us", "Massachusetts"),
    ("Minneapolis", 44.9778, -93.2650, "us", "Minnesota"),
    ("Salt Lake City", 40.7608, -111.8910, "us", "Utah"),
    ("Anchorage", 61.2181, -149.9003, "us", "Alaska"),
    ("Honolulu", 21.3069, -157.8583, "us", "Hawaii"),
    ("Kansas City", 39.0997, -94.5786, "us", "Missouri"),
    ("Nashville", 36.1627, -86.7816, "us", "Tennessee"),
    ("Charlotte", 35.2271, -80.8431, "us", "North Carolina"),
    // United Kingdom
    ("London", 51.5074, -0.1278, "gb", "England"),
    ("Manchester", 53.4808, -2.2426, "gb", "England"),
    ("Birmingham", 52.4862, -1.8904, "gb", "England"),
    ("Edinburgh", 55.9533, -3.1883, "gb", "Scotland"),
    ("Glasgow", 55.8642, -4.2518, "gb", "Scotland"),
    ("Cardiff", 51.4816, -3.1791, "gb", "Wales"),
    ("Belfast", 54.5973, -5.9301, "gb", "Northern Ireland"),
    // Canada
    ("Toronto", 43.6532, -79.3832, "ca", "Ontario"),
    ("Montreal", 45.5019, -73.5674, "ca", "Quebec"),
    ("Vancouver", 49.2827, -123.1207, "ca", "British Columbia"),
    ("Calgary", 51.0447, -114.0719, "ca", "Alberta"),
    ("Winnipeg", 49.8951, -97.1384, "ca", "Manitoba"),
    ("Halifax", 44.6488, -63.5752, "ca", "Nova Scotia"),
    // Europe
    ("Berlin", 52.5200, 13.4050, "de", "Berlin"),
    ("Munich", 48.1351, 11.5820, "de", "Bavaria"),
    ("Hamburg", 53.5511, 9.9937, "de", "Hamburg"),
    ("Frankfurt", 50.1109, 8.6821, "de", "Hesse"),
    ("Cologne", 50.9375, 6.9603, "de", "North Rhine-Westphalia"),
    ("Stuttgart", 48.7758, 9.1829, "de", "Baden-Wurttemberg"),
    ("Dresden", 51.0504, 13.7373, "de", "Saxony"),
    ("Amsterdam", 52.3676, 4.9041, "nl", "North Holland"),
    ("Rotterdam", 51.9244, 4.4777, "nl", "South Holland"),
    ("Paris", 48.8566, 2.3522, "fr", "Ile-de-France"),
    ("Marseille", 43.2965, 5.3698, "fr", "Provence-Alpes-Cote d'Azur"),
    ("Toulouse", 43.6047, 1.4442, "fr", "Occitanie"),
    ("Bordeaux", 44.8378, -0.5792, "fr", "Nouvelle-Aquitaine"),
    ("Warsaw", 52.2297, 21.0122, "pl", "Masovian Voivodeship"),
    ("Krakow", 50.0647, 19.9450, "pl", "Lesser Poland Voivodeship"),
    // Asia-Pacific
    ("Tokyo", 35.6762, 139.6503, "jp", "Tokyo"),
    ("Osaka", 34.6937, 135.5023, "jp", "Osaka"),
    ("Sapporo", 43.0618, 141.3545, "jp", "Hokkaido"),
    ("Singapore", 1.3521, 103.8198, "sg", "Singapore"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // Auckland -> Wellington is roughly 490 km.
        let d = haversine_km(-36.8485, 174.7633, -41.2866, 174.7756);
        assert!((d - 493.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn nearest_resolves_auckland() {
        let g = Gazetteer::builtin();
        // A point in suburban Auckland.
        let p = g.nearest(-36.9, 174.8).unwrap();
        assert_eq!(p.country, "nz");
        assert_eq!(p.admin1, "Auckland");
    }

    #[test]
    fn nearest_resolves_london() {
        let g = Gazetteer::builtin();
        let p = g.nearest(51.5074, -0.1278).unwrap();
        assert_eq!(p.country, "gb");
        assert_eq!(p.admin1, "England");
    }

    #[test]
    fn null_island_is_a_miss() {
        let g = Gazetteer::builtin();
        assert!(g.nearest(0.0, 0.0).is_none());
    }

    #[test]
    fn csv_rows_extend_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("places.csv");
        std::fs::write(
            &path,
            "# extra places\nQueenstown,-45.0312,168.6626,NZ,Otago\n",
        )
        .unwrap();
        let g = Gazetteer::from_csv(&path).unwrap();
        let p = g.nearest(-45.03, 168.66).unwrap();
        assert_eq!(p.name, "Queenstown");
        assert_eq!(p.country, "nz");
    }

    #[test]
    fn malformed_csv_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "only,three,fields\n").unwrap();
        assert!(Gazetteer::from_csv(&path).is_err());
    }
}
