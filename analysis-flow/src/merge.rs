use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::domain::{Domain, Operation};
use crate::result::{AnalysisResult, CompositeResult, ResultStatus};
use crate::tools::AnalysisOutput;

/// What the dashboard renders for one domain after a chat turn.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DomainAnalysis {
    Composite(CompositeResult),
    Single(AnalysisResult),
}

#[derive(Default)]
struct Collected {
    composite: Option<CompositeResult>,
    singles: Vec<(Operation, String, AnalysisResult)>,
}

/// Merge the analyses produced during one orchestration run, per domain.
///
/// A composite result wins; if several were produced the last one is kept.
/// Otherwise single results for the most recently analysed gene are kept:
/// a lone one is passed through verbatim and several are assembled into a
/// composite for that gene, keyed by operation. Failed results are dropped.
pub fn merge_analyses(outputs: Vec<AnalysisOutput>) -> BTreeMap<Domain, DomainAnalysis> {
    let mut collected: BTreeMap<Domain, Collected> = BTreeMap::new();

    for output in outputs {
        let domain = output.domain();
        match output {
            AnalysisOutput::Composite { result } => {
                if result.summary.successful > 0 {
                    collected.entry(domain).or_default().composite = Some(result);
                }
            }
            AnalysisOutput::Single {
                operation,
                gene,
                result,
                ..
            } => {
                if result.status == ResultStatus::Error {
                    continue;
                }
                collected
                    .entry(domain)
                    .or_default()
                    .singles
                    .push((operation, gene, result));
            }
        }
    }

    collected
        .into_iter()
        .filter_map(|(domain, c)| {
            if let Some(composite) = c.composite {
                return Some((domain, DomainAnalysis::Composite(composite)));
            }
            let gene = c.singles.last()?.1.clone();
            let (mut singles, other): (Vec<_>, Vec<_>) =
                c.singles.into_iter().partition(|(_, g, _)| *g == gene);
            if !other.is_empty() {
                debug!(%domain, %gene, dropped = other.len(), "Keeping analyses of the latest gene only");
            }
            if singles.len() == 1 {
                return singles
                    .pop()
                    .map(|(_, _, result)| (domain, DomainAnalysis::Single(result)));
            }
            Some((domain, DomainAnalysis::Composite(synthesize(domain, gene, singles))))
        })
        .collect()
}

fn synthesize(
    domain: Domain,
    gene: String,
    singles: Vec<(Operation, String, AnalysisResult)>,
) -> CompositeResult {
    let mut results = BTreeMap::new();
    for (operation, _, result) in singles {
        let mut key = operation.to_string();
        let mut n = 2;
        while results.contains_key(&key) {
            key = format!("{operation}_{n}");
            n += 1;
        }
        results.insert(key, result);
    }
    CompositeResult::from_results(domain, gene, results)
}
