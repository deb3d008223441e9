//! Genomic coordinates, variants, and the primary store row key scheme.
//!
//! Row keys are laid out as `CHROM 0x00 POS(u32, big endian) REF 0x00 ALT`.  Their byte
//! order thus equals the order of `Locus` (chromosome name, then position) and all variants
//! of a region occupy one contiguous key range.

use std::sync::OnceLock;

use byteorder::{BigEndian, ByteOrder};

use crate::err::ArgError;

/// A single genomic coordinate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Locus {
    /// Chromosome name.
    pub chrom: String,
    /// 1-based position.
    pub pos: u32,
}

impl Locus {
    pub fn new(chrom: &str, pos: u32) -> Self {
        Self {
            chrom: chrom.to_string(),
            pos,
        }
    }

    /// Decode the locus from a primary store row key.
    pub fn from_key(key: &[u8]) -> Result<Self, anyhow::Error> {
        let (chrom, pos, _) = split_key(key)?;
        Ok(Self { chrom, pos })
    }
}

impl std::fmt::Display for Locus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.chrom, self.pos)
    }
}

/// An inclusive chromosome interval `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region {
    pub chrom: String,
    pub start: u32,
    pub end: u32,
}

impl Region {
    pub fn new(chrom: &str, start: u32, end: u32) -> Self {
        Self {
            chrom: chrom.to_string(),
            start,
            end,
        }
    }

    /// Region spanning a whole chromosome.
    pub fn chromosome(chrom: &str) -> Self {
        Self::new(chrom, 0, u32::MAX)
    }

    pub fn contains(&self, chrom: &str, pos: u32) -> bool {
        self.chrom == chrom && self.start <= pos && pos <= self.end
    }

    /// The `[lower, upper)` row key range holding all variants of this region.
    pub fn key_range(&self) -> (Vec<u8>, Vec<u8>) {
        let lower = key_prefix(&self.chrom, self.start);
        let upper = match self.end.checked_add(1) {
            Some(end) => key_prefix(&self.chrom, end),
            None => chrom_upper_bound(&self.chrom),
        };
        (lower, upper)
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == 0 && self.end == u32::MAX {
            write!(f, "{}", self.chrom)
        } else {
            write!(f, "{}:{}-{}", self.chrom, self.start, self.end)
        }
    }
}

fn region_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^([^:\s]+)(?::([0-9,]+)(?:-([0-9,]+))?)?$").expect("valid regex")
    })
}

impl std::str::FromStr for Region {
    type Err = ArgError;

    /// Parse `CHROM`, `CHROM:POS`, or `CHROM:START-END`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let caps = region_regex()
            .captures(s)
            .ok_or_else(|| ArgError::RegionInvalidFormat(s.to_string()))?;
        let parse = |m: regex::Match<'_>| {
            m.as_str()
                .replace(',', "")
                .parse::<u32>()
                .map_err(|_| ArgError::RegionInvalidInts(s.to_string()))
        };

        let chrom = &caps[1];
        match (caps.get(2), caps.get(3)) {
            (None, _) => Ok(Region::chromosome(chrom)),
            (Some(pos), None) => {
                let pos = parse(pos)?;
                Ok(Region::new(chrom, pos, pos))
            }
            (Some(start), Some(end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(ArgError::RegionInvalidInts(s.to_string()));
                }
                Ok(Region::new(chrom, start, end))
            }
        }
    }
}

/// A variant: locus plus alleles and an opaque annotation payload.
///
/// Identity is given by coordinates and alleles only, the payload is ignored
/// for comparisons.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Variant {
    pub chromosome: String,
    pub position: u32,
    pub reference: String,
    pub alternative: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<serde_json::Value>,
}

impl Variant {
    pub fn new(chromosome: &str, position: u32, reference: &str, alternative: &str) -> Self {
        Self {
            chromosome: chromosome.to_string(),
            position,
            reference: reference.to_string(),
            alternative: alternative.to_string(),
            annotation: None,
        }
    }

    pub fn locus(&self) -> Locus {
        Locus::new(&self.chromosome, self.position)
    }

    /// Encode as primary store row key.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = key_prefix(&self.chromosome, self.position);
        key.extend_from_slice(self.reference.as_bytes());
        key.push(0);
        key.extend_from_slice(self.alternative.as_bytes());
        key
    }

    /// Decode coordinates and alleles from a primary store row key.
    pub fn from_key(key: &[u8]) -> Result<Self, anyhow::Error> {
        let (chrom, pos, alleles) = split_key(key)?;
        let sep = alleles
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| anyhow::anyhow!("no allele separator in row key {:?}", key))?;
        let reference = std::str::from_utf8(&alleles[..sep])
            .map_err(|e| anyhow::anyhow!("invalid reference allele in row key {:?}: {}", key, e))?;
        let alternative = std::str::from_utf8(&alleles[sep + 1..]).map_err(|e| {
            anyhow::anyhow!("invalid alternative allele in row key {:?}: {}", key, e)
        })?;
        Ok(Self::new(&chrom, pos, reference, alternative))
    }

    fn identity(&self) -> (&str, u32, &str, &str) {
        (
            &self.chromosome,
            self.position,
            &self.reference,
            &self.alternative,
        )
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Variant {}

impl std::hash::Hash for Variant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for Variant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.chromosome, self.position, self.reference, self.alternative
        )
    }
}

/// Row key prefix of all variants at `chrom:pos`.
pub fn key_prefix(chrom: &str, pos: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(chrom.len() + 5);
    key.extend_from_slice(chrom.as_bytes());
    key.push(0);
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, pos);
    key.extend_from_slice(&buf);
    key
}

/// Exclusive upper bound of all row keys on `chrom`.
pub fn chrom_upper_bound(chrom: &str) -> Vec<u8> {
    let mut key = chrom.as_bytes().to_vec();
    key.push(1);
    key
}

/// Split a row key into chromosome, position, and the remaining allele bytes.
fn split_key(key: &[u8]) -> Result<(String, u32, &[u8]), anyhow::Error> {
    let sep = key
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| anyhow::anyhow!("no chromosome separator in row key {:?}", key))?;
    if key.len() < sep + 5 {
        anyhow::bail!("row key {:?} too short for position", key);
    }
    let chrom = std::str::from_utf8(&key[..sep])
        .map_err(|e| anyhow::anyhow!("invalid chromosome in row key {:?}: {}", key, e))?;
    let pos = BigEndian::read_u32(&key[sep + 1..sep + 5]);
    Ok((chrom.to_string(), pos, &key[sep + 5..]))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1", Region::chromosome("1"))]
    #[case("chrX:100", Region::new("chrX", 100, 100))]
    #[case("1:2000000-3000000", Region::new("1", 2_000_000, 3_000_000))]
    #[case("1:2,000,000-3,000,000", Region::new("1", 2_000_000, 3_000_000))]
    #[case(" MT:1-16569 ", Region::new("MT", 1, 16_569))]
    fn region_from_str(#[case] s: &str, #[case] expected: Region) {
        assert_eq!(s.parse::<Region>().unwrap(), expected);
    }

    #[rstest]
    #[case("", ArgError::RegionInvalidFormat(String::new()))]
    #[case("1:a-b", ArgError::RegionInvalidFormat("1:a-b".into()))]
    #[case("1:300-200", ArgError::RegionInvalidInts("1:300-200".into()))]
    #[case("1:1-99999999999", ArgError::RegionInvalidInts("1:1-99999999999".into()))]
    fn region_from_str_invalid(#[case] s: &str, #[case] expected: ArgError) {
        assert_eq!(s.parse::<Region>().unwrap_err(), expected);
    }

    #[rstest]
    #[case("1", 2_000_000, true)]
    #[case("1", 3_000_000, true)]
    #[case("1", 1_999_999, false)]
    #[case("1", 3_000_001, false)]
    #[case("2", 2_500_000, false)]
    fn region_contains(#[case] chrom: &str, #[case] pos: u32, #[case] expected: bool) {
        let region = Region::new("1", 2_000_000, 3_000_000);
        assert_eq!(region.contains(chrom, pos), expected);
    }

    #[test]
    fn region_display_parses_back() {
        for region in [Region::chromosome("X"), Region::new("1", 10, 20)] {
            assert_eq!(region.to_string().parse::<Region>().unwrap(), region);
        }
    }

    #[test]
    fn variant_key_decodes_to_same_variant() -> Result<(), anyhow::Error> {
        // position bytes contain zeroes, make sure they do not confuse the separators
        let var = Variant::new("chr1", 256, "AC", "A");
        let key = var.to_key();

        assert_eq!(Variant::from_key(&key)?, var);
        assert_eq!(Locus::from_key(&key)?, Locus::new("chr1", 256));

        Ok(())
    }

    #[test]
    fn key_order_follows_locus_order() {
        let mut vars = vec![
            Variant::new("10", 5, "A", "C"),
            Variant::new("1", 1_000_000, "A", "C"),
            Variant::new("1", 20, "G", "T"),
            Variant::new("2", 1, "A", "C"),
        ];
        let mut by_key = vars.clone();
        by_key.sort_by_key(|v| v.to_key());
        vars.sort_by_key(|v| v.locus());

        assert_eq!(by_key, vars);
    }

    #[test]
    fn key_range_brackets_region() {
        let (lower, upper) = Region::new("1", 100, 200).key_range();
        let inside = Variant::new("1", 200, "A", "T").to_key();
        let before = Variant::new("1", 99, "A", "T").to_key();
        let after = Variant::new("1", 201, "A", "T").to_key();
        let other = Variant::new("10", 150, "A", "T").to_key();

        assert!(lower <= inside && inside < upper);
        assert!(before < lower);
        assert!(after >= upper);
        assert!(other >= upper);

        let (_, upper) = Region::chromosome("1").key_range();
        assert!(Variant::new("1", u32::MAX, "A", "T").to_key() < upper);
        assert!(Variant::new("10", 0, "A", "T").to_key() >= upper);
    }

    #[test]
    fn variant_identity_ignores_annotation() {
        let mut lhs = Variant::new("1", 10, "A", "G");
        lhs.annotation = Some(serde_json::json!({"gene": "BRCA1"}));
        let rhs = Variant::new("1", 10, "A", "G");

        assert_eq!(lhs, rhs);
        assert_ne!(rhs, Variant::new("1", 10, "A", "T"));
    }

    #[test]
    fn truncated_key_is_error() {
        assert!(Locus::from_key(b"1\0\0\0").is_err());
        assert!(Variant::from_key(b"no-separator").is_err());
    }
}
