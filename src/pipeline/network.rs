//! Adjacency matrices from long-format peer ratings.
//!
//! Each rating says "respondent `from` scored `to` on question `q`". A network
//! is a named set of question codes; its weighted matrix holds the mean score
//! per (from, to) pair and its binary matrix thresholds that mean.

use crate::models::{NetworkConfig, Result, SurveyorError};
use crate::table::Table;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One parsed rating.
#[derive(Debug, Clone, PartialEq)]
pub struct Rating {
    pub from: String,
    pub to: String,
    pub question: String,
    pub score: f64,
}

/// Parse ratings from a long-format table.
///
/// Node codes are lowercased. Rows whose score is not a number are skipped.
pub fn load_ratings(table: &Table, config: &NetworkConfig) -> Result<Vec<Rating>> {
    let column = |name: &str| {
        table.column_index(name).ok_or_else(|| {
            SurveyorError::InvalidInput(format!("ratings table has no '{name}' column"))
        })
    };
    let from_col = column(&config.from_column)?;
    let to_col = column(&config.to_column)?;
    let question_col = column(&config.question_column)?;
    let score_col = column(&config.score_column)?;

    let mut ratings = Vec::with_capacity(table.len());
    let mut skipped = 0usize;
    for i in 0..table.len() {
        let raw = table.cell(i, score_col).trim();
        let Ok(score) = raw.parse::<f64>() else {
            skipped += 1;
            debug!(row = i, score = raw, "Skipping rating without a numeric score");
            continue;
        };
        if !score.is_finite() {
            skipped += 1;
            continue;
        }
        ratings.push(Rating {
            from: table.cell(i, from_col).trim().to_lowercase(),
            to: table.cell(i, to_col).trim().to_lowercase(),
            question: table.cell(i, question_col).trim().to_string(),
            score,
        });
    }

    if skipped > 0 {
        warn!(skipped, "Ratings without a numeric score were ignored");
    }
    Ok(ratings)
}

/// Sorted unique respondent codes.
pub fn node_list(ratings: &[Rating]) -> Vec<String> {
    ratings
        .iter()
        .filter(|r| !r.from.is_empty())
        .map(|r| r.from.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Square matrix over a fixed node list. The diagonal is always NaN.
#[derive(Debug, Clone)]
pub struct AdjacencyMatrix {
    nodes: Vec<String>,
    values: Vec<f64>,
}

impl AdjacencyMatrix {
    fn zeroed(nodes: Vec<String>) -> Self {
        let n = nodes.len();
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            values[i * n + i] = f64::NAN;
        }
        Self { nodes, values }
    }

    /// Mean score per (from, to) over ratings whose question is in `questions`.
    ///
    /// Pairs without ratings are 0.0. Ratings naming an unknown node are ignored.
    pub fn weighted(nodes: &[String], ratings: &[Rating], questions: &[String]) -> Self {
        let position: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let questions: HashSet<&str> = questions.iter().map(String::as_str).collect();

        let n = nodes.len();
        let mut sums = vec![0.0; n * n];
        let mut counts = vec![0u32; n * n];
        for rating in ratings.iter().filter(|r| questions.contains(r.question.as_str())) {
            let (Some(&i), Some(&j)) = (
                position.get(rating.from.as_str()),
                position.get(rating.to.as_str()),
            ) else {
                continue;
            };
            sums[i * n + j] += rating.score;
            counts[i * n + j] += 1;
        }

        let mut matrix = Self::zeroed(nodes.to_vec());
        for i in 0..n {
            for j in (0..n).filter(|&j| j != i) {
                let k = i * n + j;
                if counts[k] > 0 {
                    matrix.values[k] = sums[k] / f64::from(counts[k]);
                }
            }
        }
        matrix
    }

    /// 1.0 where the value is at least `threshold`, else 0.0.
    pub fn binarize(&self, threshold: f64) -> Self {
        let n = self.size();
        let mut matrix = self.clone();
        for (k, value) in matrix.values.iter_mut().enumerate() {
            if k / n.max(1) != k % n.max(1) {
                *value = if *value >= threshold { 1.0 } else { 0.0 };
            }
        }
        matrix
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, from: usize, to: usize) -> f64 {
        self.values[from * self.size() + to]
    }

    /// Table with the row node in the first column; NaN becomes an empty cell.
    pub fn to_table(&self) -> Table {
        let mut columns = Vec::with_capacity(self.size() + 1);
        columns.push(String::new());
        columns.extend(self.nodes.iter().cloned());

        let mut table = Table::new(columns);
        for (i, node) in self.nodes.iter().enumerate() {
            let mut cells = Vec::with_capacity(self.size() + 1);
            cells.push(node.clone());
            cells.extend((0..self.size()).map(|j| format_value(self.get(i, j))));
            table.push_row(cells);
        }
        table
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        format!("{value:?}")
    }
}

/// Matrices written for one network.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub name: String,
    pub weighted_path: PathBuf,
    pub binary_path: PathBuf,
    /// Non-zero off-diagonal cells of the binary matrix
    pub edges: usize,
}

/// Builds every configured network and writes its matrices.
pub struct NetworkBuilder {
    config: NetworkConfig,
}

impl NetworkBuilder {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }

    /// Weighted and binary matrices for every configured network.
    pub fn build(&self, ratings: &[Rating]) -> Vec<(String, AdjacencyMatrix, AdjacencyMatrix)> {
        let nodes = node_list(ratings);
        self.config
            .networks
            .iter()
            .map(|(name, questions)| {
                let weighted = AdjacencyMatrix::weighted(&nodes, ratings, questions);
                let binary = if self.config.binary_networks.contains(name) {
                    weighted.clone()
                } else {
                    weighted.binarize(self.config.threshold)
                };
                (name.clone(), weighted, binary)
            })
            .collect()
    }

    /// Read the ratings table and write `{NET}_weighted` / `{NET}_binary` CSVs.
    pub fn run(&self) -> Result<Vec<NetworkOutput>> {
        let table = Table::read(&self.config.input)?;
        let ratings = load_ratings(&table, &self.config)?;
        let nodes = node_list(&ratings);
        info!(
            path = %self.config.input.display(),
            ratings = ratings.len(),
            nodes = nodes.len(),
            "Loaded ratings"
        );

        fs::create_dir_all(&self.config.output_dir)
            .map_err(|e| SurveyorError::io("creating matrix output dir", e))?;

        let mut outputs = Vec::new();
        for (name, weighted, binary) in self.build(&ratings) {
            let weighted_path = matrix_path(&self.config.output_dir, &name, "weighted");
            let binary_path = matrix_path(&self.config.output_dir, &name, "binary");
            weighted.to_table().write(&weighted_path)?;
            binary.to_table().write(&binary_path)?;

            let n = binary.size();
            let edges = (0..n)
                .flat_map(|i| (0..n).map(move |j| (i, j)))
                .filter(|&(i, j)| i != j && binary.get(i, j) > 0.0)
                .count();
            info!(network = %name, edges, "Matrices written");

            outputs.push(NetworkOutput {
                name,
                weighted_path,
                binary_path,
                edges,
            });
        }
        Ok(outputs)
    }
}

fn matrix_path(dir: &Path, network: &str, kind: &str) -> PathBuf {
    dir.join(format!("{network}_{kind}.csv"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn rating(from: &str, to: &str, question: &str, score: f64) -> Rating {
        Rating {
            from: from.to_string(),
            to: to.to_string(),
            question: question.to_string(),
            score,
        }
    }

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_weighted_mean_zero_and_nan_diagonal() {
        let ratings = vec![
            rating("a", "b", "CC_01", 2.0),
            rating("a", "b", "CC_02", 4.0),
            rating("b", "a", "CC_01", 1.0),
            rating("b", "a", "EC_01", 5.0),
            rating("a", "a", "CC_01", 5.0),
            rating("a", "zz", "CC_01", 5.0),
        ];
        let nodes = node_list(&ratings);
        assert_eq!(nodes, ["a", "b"]);

        let m = AdjacencyMatrix::weighted(&nodes, &ratings, &codes(&["CC_01", "CC_02"]));
        assert_eq!(m.get(0, 1), 3.0);
        assert_eq!(m.get(1, 0), 1.0);
        assert!(m.get(0, 0).is_nan());
        assert!(m.get(1, 1).is_nan());

        let empty = AdjacencyMatrix::weighted(&nodes, &ratings, &codes(&["CM_01"]));
        assert_eq!(empty.get(0, 1), 0.0);
    }

    #[test]
    fn test_binarize_threshold_is_inclusive() {
        let ratings = vec![
            rating("a", "b", "q", 2.5),
            rating("b", "c", "q", 2.4),
            rating("c", "a", "q", 4.0),
        ];
        let nodes = node_list(&ratings);
        let binary = AdjacencyMatrix::weighted(&nodes, &ratings, &codes(&["q"])).binarize(2.5);

        assert_eq!(binary.get(0, 1), 1.0);
        assert_eq!(binary.get(1, 2), 0.0);
        assert_eq!(binary.get(2, 0), 1.0);
        assert!(binary.get(2, 2).is_nan());
    }

    #[test]
    fn test_load_ratings_lowercases_and_skips_bad_scores() {
        let config = NetworkConfig::default();
        let mut table = Table::new(codes(&[
            "Cod profilo rispondente",
            "Codice domanda",
            "Cod profilo valutato",
            "Risposta numerica",
        ]));
        table.push_row(codes(&["P01", "CC_01", "P02", "3"]));
        table.push_row(codes(&["P02", "CC_01", "P01", ""]));
        table.push_row(codes(&["P02", "CC_01", "P01", "n/a"]));

        let ratings = load_ratings(&table, &config).unwrap();
        assert_eq!(ratings, vec![rating("p01", "p02", "CC_01", 3.0)]);
    }

    #[test]
    fn test_run_writes_matrices() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("ratings.csv");
        fs::write(
            &input,
            "Cod profilo rispondente,Codice domanda,Cod profilo valutato,Risposta numerica\n\
             A,CC_01,B,4\n\
             B,CC_01,A,1\n\
             A,FR_01,B,1\n",
        )
        .unwrap();

        let mut networks = BTreeMap::new();
        networks.insert("CC".to_string(), codes(&["CC_01"]));
        networks.insert("FR".to_string(), codes(&["FR_01"]));
        let config = NetworkConfig {
            input,
            output_dir: dir.path().join("out"),
            networks,
            ..Default::default()
        };

        let outputs = NetworkBuilder::new(config).run().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].name, "CC");
        assert_eq!(outputs[0].edges, 1);

        let weighted = fs::read_to_string(dir.path().join("out/CC_weighted.csv")).unwrap();
        assert_eq!(weighted, ",a,b\na,,4.0\nb,1.0,\n");
        let binary = fs::read_to_string(dir.path().join("out/CC_binary.csv")).unwrap();
        assert_eq!(binary, ",a,b\na,,1.0\nb,0.0,\n");
        // Already-binary networks are copied as-is
        let fr = fs::read_to_string(dir.path().join("out/FR_binary.csv")).unwrap();
        assert_eq!(fr, ",a,b\na,,1.0\nb,0.0,\n");
    }
}
