use dblens::analyzer::redundant;
use dblens::config::{AnalyzerConfig, RankerConfig};
use dblens::ranker::rank;
use dblens::recommendations::Target;
use dblens::snapshot::{IndexStats, MetricSnapshot};
use dblens::{Category, Recommendation, Scope, Severity, Source};

/// Small xorshift generator so every case is reproducible.
struct Cases(u64);

impl Cases {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[(self.next() % items.len() as u64) as usize]
    }

    fn unit(&mut self) -> f64 {
        (self.next() % 1001) as f64 / 1000.0
    }
}

const COLUMNS: [&str; 4] = ["a", "b", "c", "d"];

fn candidates(cases: &mut Cases, source: Source, count: usize) -> Vec<Recommendation> {
    (0..count)
        .map(|_| {
            let category = *cases.pick(&[
                Category::MissingIndex,
                Category::UnusedIndex,
                Category::RedundantIndex,
                Category::Advisory,
            ]);
            let severity = *cases.pick(&Severity::ALL);
            let column = cases.pick(&COLUMNS).to_string();
            let target = if category.targets_existing_index() {
                Target::index("shop", "orders", format!("idx_{column}"), vec![column.clone()])
            } else {
                Target::columns("shop", "orders", vec![column.clone()])
            };
            let confidence = cases.unit();
            Recommendation::new(
                category,
                severity,
                confidence,
                format!("{category} on {column}"),
                None,
                source,
                target,
            )
        })
        .collect()
}

#[test]
fn ranking_is_deterministic_and_deduplicated() {
    let config = RankerConfig::default();
    for seed in 1..=40u64 {
        let mut cases = Cases(seed * 0x9E37_79B9);
        let heuristic = candidates(&mut cases, Source::Heuristic, 12);
        let llm = candidates(&mut cases, Source::Llm, 8);

        let first = rank(heuristic.clone(), llm.clone(), &config);
        let mut reversed_h = heuristic.clone();
        reversed_h.reverse();
        let mut reversed_l = llm.clone();
        reversed_l.reverse();
        let second = rank(reversed_h, reversed_l, &config);

        let ids = |recs: &[Recommendation]| recs.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second), "seed {seed}");

        let mut unique = ids(&first);
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), first.len(), "seed {seed}: duplicate fingerprints");

        for pair in first.windows(2) {
            assert!(pair[0].severity >= pair[1].severity, "seed {seed}: severity order");
        }
    }
}

#[test]
fn merged_confidence_is_never_below_either_source() {
    let config = RankerConfig::default();
    for seed in 1..=40u64 {
        let mut cases = Cases(seed * 0x85EB_CA6B);
        let heuristic = candidates(&mut cases, Source::Heuristic, 10);
        let llm = candidates(&mut cases, Source::Llm, 10);
        let ranked = rank(heuristic.clone(), llm.clone(), &config);

        for rec in ranked.iter().filter(|r| r.source == Source::Merged) {
            let best = heuristic
                .iter()
                .chain(llm.iter())
                .filter(|c| c.id == rec.id)
                .map(|c| c.confidence)
                .fold(0.0_f64, f64::max);
            assert!(rec.confidence >= best, "seed {seed}: {} < {best}", rec.confidence);
            assert!(rec.confidence <= 1.0);
        }
    }
}

#[test]
fn every_strict_prefix_index_is_reported_as_redundant() {
    let config = AnalyzerConfig::default();
    for seed in 1..=40u64 {
        let mut cases = Cases(seed * 0xC2B2_AE35);
        let mut snapshot = MetricSnapshot::empty(Scope::schema("shop"));
        let mut definitions: Vec<Vec<String>> = Vec::new();
        for i in 0..5 {
            let width = 1 + (cases.next() % 3) as usize;
            let start = (cases.next() % 2) as usize;
            let columns: Vec<String> = COLUMNS[start..start + width]
                .iter()
                .map(|c| c.to_string())
                .collect();
            snapshot.indexes.push(IndexStats {
                schema: "shop".into(),
                table: "orders".into(),
                index: format!("idx_{i}"),
                columns: columns.clone(),
                unique: false,
                primary: false,
                size_bytes: Some(1 << 20),
                read_count: Some(10),
                write_count: Some(10),
                usage_tracked: true,
            });
            definitions.push(columns);
        }

        let flagged: Vec<String> = redundant::detect(&snapshot, &config)
            .into_iter()
            .map(|r| {
                assert_eq!(r.category, Category::RedundantIndex);
                r.target.index.unwrap_or_default()
            })
            .collect();

        for (i, columns) in definitions.iter().enumerate() {
            let is_prefix = definitions
                .iter()
                .any(|other| other.len() > columns.len() && other[..columns.len()] == columns[..]);
            if is_prefix {
                assert!(
                    flagged.contains(&format!("idx_{i}")),
                    "seed {seed}: idx_{i} {columns:?} not flagged"
                );
            }
        }

        // Some index always survives: the widest one is never reported as a prefix.
        assert!(flagged.len() < definitions.len(), "seed {seed}");
    }
}
