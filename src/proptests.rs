use super::*;

use proptest::prelude::*;

/// Structural checks over the private node representation: interior nodes
/// only above full depth, uncovered leaves empty, record sets canonical, and
/// no sibling leaf pair that compaction should have merged.
fn validate_trie<R: Clone + Ord + std::fmt::Debug>(trie: &CidrTrie<R>) {
    fn walk<R: Ord + std::fmt::Debug>(node: &Node<R>, depth: u32, bits: u32) {
        match node {
            Node::Leaf { covered, records } => {
                assert!(depth <= bits, "leaf deeper than the family width");
                if !covered {
                    assert!(records.is_empty(), "uncovered leaf holds records");
                }
                assert!(
                    records.windows(2).all(|w| w[0] < w[1]),
                    "record set must be sorted and duplicate-free: {records:?}"
                );
            }
            Node::Interior { children } => {
                assert!(depth < bits, "interior node at full depth {depth}");
                if let (
                    Node::Leaf {
                        covered: c0,
                        records: r0,
                    },
                    Node::Leaf {
                        covered: c1,
                        records: r1,
                    },
                ) = (children[0].as_ref(), children[1].as_ref())
                {
                    assert!(
                        !(c0 == c1 && r0 == r1),
                        "equal sibling leaves survived compaction at depth {depth}"
                    );
                }
                walk(&children[0], depth + 1, bits);
                walk(&children[1], depth + 1, bits);
            }
        }
    }
    walk(&trie.root, 0, trie.version().bits());
}

fn cidr_strategy(version: IpVersion) -> impl Strategy<Value = Cidr> {
    let bits = version.bits() as u8;
    (any::<u128>(), 0..=bits).prop_map(move |(address, len)| Cidr::new(version, address, len))
}

/// A `cidr_strategy` variant confined to a handful of bases so prefixes
/// actually nest and collide instead of scattering across the space.
fn clustered_cidr_strategy(version: IpVersion) -> impl Strategy<Value = Cidr> {
    let bits = version.bits() as u8;
    (0u128..4, any::<u128>(), 0..=bits).prop_map(move |(base, low, len)| {
        let address = (base << (version.bits() - 2)) | (low >> 2);
        Cidr::new(version, address, len)
    })
}

fn host_mask(version: IpVersion, len: u8) -> u128 {
    let host = version.bits() - u32::from(len);
    if host == 128 {
        !0
    } else {
        (1u128 << host) - 1
    }
}

/// Reference model: a flat list of registered prefixes, no compaction.
/// Query is a linear subset test with sorted, deduplicated output (the same
/// canonical form the trie returns).
fn model_query(model: &[(Cidr, u16)], address: u128) -> Vec<u16> {
    let mut out: Vec<u16> = model
        .iter()
        .filter(|(cidr, _)| cidr.contains(address))
        .map(|(_, record)| *record)
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

fn check_against_model(version: IpVersion, ops: &[(Cidr, u16)], mut probes: Vec<u128>) {
    let mut trie = CidrTrie::new(version);
    let mut model: Vec<(Cidr, u16)> = Vec::new();

    for (cidr, record) in ops {
        trie.insert(cidr, *record);
        model.push((*cidr, *record));
        validate_trie(&trie);
    }

    // Probe each registered prefix at both ends of its range on top of the
    // caller's random probes.
    for (cidr, _) in ops {
        probes.push(cidr.address());
        probes.push(cidr.address() | host_mask(version, cidr.len()));
    }

    let mask = family_mask(version.bits());
    for probe in probes {
        let probe = probe & mask;
        assert_eq!(
            trie.query(probe),
            model_query(&model, probe),
            "trie and flat model disagree at {probe:#x}"
        );
    }

    // Compaction bounds node count by the registered boundaries, not by the
    // insert count: each prefix contributes at most one split per depth.
    let bound = 2 * (version.bits() as usize + 1) * ops.len() + 1;
    assert!(
        trie.node_count() <= bound,
        "node count {} exceeds bound {bound}",
        trie.node_count()
    );
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_matches_flat_model_v4(
        ops in prop::collection::vec((clustered_cidr_strategy(IpVersion::V4), 0u16..8), 1..64),
        probes in prop::collection::vec(any::<u32>(), 0..32),
    ) {
        let probes = probes.into_iter().map(u128::from).collect();
        check_against_model(IpVersion::V4, &ops, probes);
    }

    #[test]
    fn prop_matches_flat_model_v6(
        ops in prop::collection::vec((clustered_cidr_strategy(IpVersion::V6), 0u16..8), 1..48),
        probes in prop::collection::vec(any::<u128>(), 0..32),
    ) {
        check_against_model(IpVersion::V6, &ops, probes);
    }

    #[test]
    fn prop_matches_flat_model_scattered_v4(
        ops in prop::collection::vec((cidr_strategy(IpVersion::V4), 0u16..8), 1..64),
        probes in prop::collection::vec(any::<u32>(), 0..32),
    ) {
        let probes = probes.into_iter().map(u128::from).collect();
        check_against_model(IpVersion::V4, &ops, probes);
    }

    #[test]
    fn prop_reinsert_changes_nothing(
        ops in prop::collection::vec((clustered_cidr_strategy(IpVersion::V4), 0u16..8), 1..32),
    ) {
        let mut once = CidrTrie::new(IpVersion::V4);
        let mut twice = CidrTrie::new(IpVersion::V4);
        for (cidr, record) in &ops {
            once.insert(cidr, *record);
            twice.insert(cidr, *record);
            twice.insert(cidr, *record);
        }
        prop_assert_eq!(once.node_count(), twice.node_count());
        for (cidr, _) in &ops {
            prop_assert_eq!(once.query(cidr.address()), twice.query(cidr.address()));
        }
    }

    #[test]
    fn prop_v4_parse_roundtrip(octets in any::<[u8; 4]>(), len in 0u8..=32) {
        let text = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
        let expected = u128::from(u32::from_be_bytes(octets));

        let address = parse_address(IpVersion::V4, &text).unwrap();
        prop_assert_eq!(address, expected);

        // Bare address text defaults to an exact host match.
        let bare = parse_cidr(IpVersion::V4, &text).unwrap();
        prop_assert_eq!(bare.len(), 32);
        prop_assert_eq!(bare.address(), expected);

        let cidr = parse_cidr(IpVersion::V4, &format!("{text}/{len}")).unwrap();
        prop_assert_eq!(cidr.len(), len);
        prop_assert!(cidr.contains(expected));
    }

    #[test]
    fn prop_v6_parse_roundtrip(groups in any::<[u16; 8]>(), len in 0u8..=128) {
        let text = groups
            .iter()
            .map(|g| format!("{g:x}"))
            .collect::<Vec<_>>()
            .join(":");
        let expected = groups
            .iter()
            .fold(0u128, |acc, &g| (acc << 16) | u128::from(g));

        let address = parse_address(IpVersion::V6, &text).unwrap();
        prop_assert_eq!(address, expected);

        let bare = parse_cidr(IpVersion::V6, &text).unwrap();
        prop_assert_eq!(bare.len(), 128);
        prop_assert_eq!(bare.address(), expected);

        let cidr = parse_cidr(IpVersion::V6, &format!("{text}/{len}")).unwrap();
        prop_assert_eq!(cidr.len(), len);
        prop_assert!(cidr.contains(expected));
    }

    #[test]
    fn prop_detect_version_is_exclusive(text in "[0-9a-f:.]{0,48}") {
        // A literal classifies as at most one family.
        let v4 = parse_address(IpVersion::V4, &text).is_ok();
        let v6 = parse_address(IpVersion::V6, &text).is_ok();
        prop_assert!(!(v4 && v6), "{text:?} parsed as both families");
        match detect_version(&text) {
            Some(IpVersion::V4) => prop_assert!(v4),
            Some(IpVersion::V6) => prop_assert!(v6),
            None => prop_assert!(!v4 && !v6),
        }
    }
}

/// Exhaustive check over a tiny 4-bit-style corner of the IPv4 space:
/// every insert order of a fixed overlapping prefix set must produce
/// identical query results.
#[test]
fn exhaustive_insert_order_overlapping_set() {
    let prefixes = [
        ("0.0.0.0/0", 0u16),
        ("128.0.0.0/1", 1),
        ("192.0.0.0/2", 2),
        ("192.0.2.0/24", 3),
        ("192.0.2.128/25", 4),
    ];

    fn for_each_permutation<T: Clone>(items: &[T], f: &mut impl FnMut(&[T])) {
        fn rec<T: Clone>(
            items: &[T],
            used: &mut [bool],
            out: &mut Vec<T>,
            f: &mut impl FnMut(&[T]),
        ) {
            if out.len() == items.len() {
                f(out);
                return;
            }
            for i in 0..items.len() {
                if used[i] {
                    continue;
                }
                used[i] = true;
                out.push(items[i].clone());
                rec(items, used, out, f);
                out.pop();
                used[i] = false;
            }
        }
        let mut used = vec![false; items.len()];
        let mut out = Vec::with_capacity(items.len());
        rec(items, &mut used, &mut out, f);
    }

    let parsed: Vec<(Cidr, u16)> = prefixes
        .iter()
        .map(|(text, record)| (parse_cidr(IpVersion::V4, text).unwrap(), *record))
        .collect();

    let probes: Vec<u128> = [
        "0.0.0.0",
        "127.255.255.255",
        "128.0.0.0",
        "191.255.255.255",
        "192.0.2.0",
        "192.0.2.127",
        "192.0.2.128",
        "192.0.2.255",
        "192.0.3.0",
        "255.255.255.255",
    ]
    .iter()
    .map(|text| parse_address(IpVersion::V4, text).unwrap())
    .collect();

    for_each_permutation(&parsed, &mut |perm| {
        let mut trie = CidrTrie::new(IpVersion::V4);
        for (cidr, record) in perm {
            trie.insert(cidr, *record);
        }
        validate_trie(&trie);
        for &probe in &probes {
            assert_eq!(
                trie.query(probe),
                model_query(&parsed, probe),
                "disagreement at {probe:#x}"
            );
        }
    });
}
