use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FlowError;

/// Analysis domains served by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Phospho,
    Transcriptome,
    #[serde(rename = "singlecell")]
    SingleCell,
    Proteomics,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Phospho,
        Domain::Transcriptome,
        Domain::SingleCell,
        Domain::Proteomics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Phospho => "phospho",
            Domain::Transcriptome => "transcriptome",
            Domain::SingleCell => "singlecell",
            Domain::Proteomics => "proteomics",
        }
    }

    /// Prefix used for this domain's environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Domain::Phospho => "PHOSPHO",
            Domain::Transcriptome => "TRANSCRIPTOME",
            Domain::SingleCell => "SINGLECELL",
            Domain::Proteomics => "PROTEOMICS",
        }
    }

    pub fn profile(&self) -> &'static DomainProfile {
        match self {
            Domain::Phospho => &PHOSPHO,
            Domain::Transcriptome => &TRANSCRIPTOME,
            Domain::SingleCell => &SINGLE_CELL,
            Domain::Proteomics => &PROTEOMICS,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phospho" | "phosphoproteomics" => Ok(Domain::Phospho),
            "transcriptome" | "transcriptomics" => Ok(Domain::Transcriptome),
            "singlecell" | "single-cell" | "single_cell" => Ok(Domain::SingleCell),
            "proteomics" | "proteome" => Ok(Domain::Proteomics),
            other => Err(FlowError::validation(format!("unknown analysis domain '{other}'"))),
        }
    }
}

/// Named operations a domain may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Query,
    GroupedComparison,
    Survival,
    Correlation,
    Enrichment,
    Comprehensive,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Query => "query",
            Operation::GroupedComparison => "grouped_comparison",
            Operation::Survival => "survival",
            Operation::Correlation => "correlation",
            Operation::Enrichment => "enrichment",
            Operation::Comprehensive => "comprehensive",
        }
    }

    /// Path segment of the remote endpoint serving this operation.
    pub fn remote_path(&self) -> &'static str {
        match self {
            Operation::GroupedComparison => "grouped-comparison",
            other => other.as_str(),
        }
    }

    /// Remote-call budget: short for point queries, minutes for heavy compute.
    pub fn remote_timeout(&self) -> Duration {
        match self {
            Operation::Query => Duration::from_secs(30),
            Operation::GroupedComparison | Operation::Survival | Operation::Correlation => {
                Duration::from_secs(120)
            }
            Operation::Enrichment | Operation::Comprehensive => Duration::from_secs(600),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "query" | "sites" | "expression" => Ok(Operation::Query),
            "grouped_comparison" | "boxplot" | "comparison" => Ok(Operation::GroupedComparison),
            "survival" => Ok(Operation::Survival),
            "correlation" => Ok(Operation::Correlation),
            "enrichment" => Ok(Operation::Enrichment),
            "comprehensive" | "all" => Ok(Operation::Comprehensive),
            other => Err(FlowError::validation(format!("unknown operation '{other}'"))),
        }
    }
}

/// Auxiliary parameter a prerequisite lookup can discover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Site,
    Dataset,
}

impl Param {
    pub fn as_str(&self) -> &'static str {
        match self {
            Param::Site => "site",
            Param::Dataset => "dataset",
        }
    }
}

/// Default value discovered from the prerequisite lookup's records.
#[derive(Debug)]
pub struct Discovery {
    pub param: Param,
    /// Record field holding candidate values; the first record wins.
    pub field: &'static str,
    /// Operations that cannot run without the discovered value.
    pub required_by: &'static [Operation],
}

/// Static description of what a domain can do.
#[derive(Debug)]
pub struct DomainProfile {
    pub domain: Domain,
    pub operations: &'static [Operation],
    pub prerequisite: Operation,
    pub discovery: Option<Discovery>,
}

impl DomainProfile {
    pub fn supports(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    /// Operations fanned out after the prerequisite during a comprehensive run.
    pub fn dependent_operations(&self) -> impl Iterator<Item = Operation> + '_ {
        self.operations
            .iter()
            .copied()
            .filter(move |op| *op != self.prerequisite && *op != Operation::Comprehensive)
    }

    pub fn requires_discovery(&self, operation: Operation) -> Option<&Discovery> {
        self.discovery
            .as_ref()
            .filter(|d| d.required_by.contains(&operation))
    }
}

static PHOSPHO: DomainProfile = DomainProfile {
    domain: Domain::Phospho,
    operations: &[
        Operation::Query,
        Operation::GroupedComparison,
        Operation::Survival,
        Operation::Correlation,
        Operation::Comprehensive,
    ],
    prerequisite: Operation::Query,
    discovery: Some(Discovery {
        param: Param::Site,
        field: "site",
        required_by: &[Operation::GroupedComparison, Operation::Survival],
    }),
};

static TRANSCRIPTOME: DomainProfile = DomainProfile {
    domain: Domain::Transcriptome,
    operations: &[
        Operation::Query,
        Operation::GroupedComparison,
        Operation::Survival,
        Operation::Correlation,
        Operation::Enrichment,
        Operation::Comprehensive,
    ],
    prerequisite: Operation::Query,
    discovery: Some(Discovery {
        param: Param::Dataset,
        field: "dataset",
        required_by: &[],
    }),
};

static SINGLE_CELL: DomainProfile = DomainProfile {
    domain: Domain::SingleCell,
    operations: &[
        Operation::Query,
        Operation::GroupedComparison,
        Operation::Correlation,
        Operation::Comprehensive,
    ],
    prerequisite: Operation::Query,
    discovery: Some(Discovery {
        param: Param::Dataset,
        field: "dataset",
        required_by: &[],
    }),
};

static PROTEOMICS: DomainProfile = DomainProfile {
    domain: Domain::Proteomics,
    operations: &[
        Operation::Query,
        Operation::GroupedComparison,
        Operation::Survival,
        Operation::Correlation,
        Operation::Comprehensive,
    ],
    prerequisite: Operation::Query,
    discovery: None,
};
