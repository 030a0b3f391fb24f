//! Bagged CART forest over aggregated customer rows.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::aggregator::AggregatedCustomerRow;
use crate::classifier::{
    check_feature_names, feature_vector, training_matrix, ClassifierError, RiskClassifier,
    MODEL_FEATURES,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features tried per split. `None` means round(sqrt(width)).
    pub max_features: Option<usize>,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 8,
            min_samples_leaf: 1,
            max_features: None,
            seed: 42,
        }
    }
}

impl ForestConfig {
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.n_trees == 0 {
            return Err(ClassifierError::InvalidConfig(
                "n_trees must be at least 1".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(ClassifierError::InvalidConfig(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if self.min_samples_leaf == 0 {
            return Err(ClassifierError::InvalidConfig(
                "min_samples_leaf must be at least 1".to_string(),
            ));
        }
        if self.max_features == Some(0) {
            return Err(ClassifierError::InvalidConfig(
                "max_features must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn features_per_split(&self, width: usize) -> usize {
        let default = (width as f64).sqrt().round() as usize;
        self.max_features.unwrap_or(default).clamp(1, width)
    }
}

/// Arena node. Children always sit at higher indices than their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        positive_rate: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Positive-class rate of the leaf `features` lands in. Goes left when
    /// `value <= threshold`.
    pub fn leaf_rate(&self, features: &[f64]) -> Result<f64, ClassifierError> {
        let mut index = 0;
        loop {
            match self.nodes.get(index) {
                Some(TreeNode::Leaf { positive_rate }) => return Ok(*positive_rate),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = features.get(*feature).ok_or(ClassifierError::DimensionMismatch {
                        expected: feature + 1,
                        actual: features.len(),
                    })?;
                    index = if *value <= *threshold { *left } else { *right };
                }
                None => {
                    return Err(ClassifierError::NonFinite(format!(
                        "tree node {index} is missing"
                    )))
                }
            }
        }
    }

    fn validate(&self, width: usize) -> Result<(), ClassifierError> {
        if self.nodes.is_empty() {
            return Err(ClassifierError::InvalidConfig("tree has no nodes".to_string()));
        }
        for (index, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Leaf { positive_rate } => {
                    if !(0.0..=1.0).contains(positive_rate) {
                        return Err(ClassifierError::NonFinite(format!(
                            "leaf {index} rate {positive_rate}"
                        )));
                    }
                }
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= width {
                        return Err(ClassifierError::DimensionMismatch {
                            expected: width,
                            actual: feature + 1,
                        });
                    }
                    if !threshold.is_finite() {
                        return Err(ClassifierError::NonFinite(format!(
                            "split {index} threshold"
                        )));
                    }
                    for child in [left, right] {
                        if *child <= index || *child >= self.nodes.len() {
                            return Err(ClassifierError::InvalidConfig(format!(
                                "split {index} points at node {child}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Random forest of Gini-split trees grown on bootstrap samples. The
/// probability is the mean leaf rate across trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    pub feature_names: Vec<String>,
    pub trees: Vec<DecisionTree>,
    pub config: ForestConfig,
}

impl RandomForest {
    pub fn fit(
        rows: &[AggregatedCustomerRow],
        labels: &[u8],
        config: &ForestConfig,
    ) -> Result<Self, ClassifierError> {
        config.validate()?;
        let raw = training_matrix(rows, labels)?;
        let width = MODEL_FEATURES.len();
        let mut grower = TreeGrower {
            raw: &raw,
            labels,
            config,
            features_per_split: config.features_per_split(width),
            rng: Pcg64Mcg::seed_from_u64(config.seed),
        };

        let n = raw.len();
        let trees = (0..config.n_trees)
            .map(|_| {
                let sample: Vec<usize> = (0..n).map(|_| grower.rng.gen_range(0..n)).collect();
                grower.grow(sample)
            })
            .collect::<Vec<_>>();

        info!(
            component = "classifier",
            event = "forest.fit.finish",
            rows = rows.len(),
            trees = trees.len(),
            nodes = trees.iter().map(|tree| tree.nodes.len()).sum::<usize>()
        );

        Ok(Self {
            feature_names: MODEL_FEATURES.iter().map(|name| name.to_string()).collect(),
            trees,
            config: *config,
        })
    }

    /// Checks internal consistency of a deserialized forest.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        check_feature_names(&self.feature_names)?;
        if self.trees.is_empty() {
            return Err(ClassifierError::InvalidConfig("forest has no trees".to_string()));
        }
        for tree in &self.trees {
            tree.validate(self.feature_names.len())?;
        }
        Ok(())
    }

    pub(crate) fn hash_parameters(&self, hasher: &mut Sha256) {
        for tree in &self.trees {
            hasher.update("tree:");
            for node in &tree.nodes {
                match node {
                    TreeNode::Leaf { positive_rate } => {
                        hasher.update(format!("L{:016x},", positive_rate.to_bits()));
                    }
                    TreeNode::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        hasher.update(format!(
                            "S{feature}:{:016x}:{left}:{right},",
                            threshold.to_bits()
                        ));
                    }
                }
            }
        }
    }
}

impl RiskClassifier for RandomForest {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict_proba(&self, rows: &[AggregatedCustomerRow]) -> Result<Vec<f64>, ClassifierError> {
        rows.iter()
            .map(|row| {
                let features = feature_vector(row);
                let mut total = 0.0;
                for tree in &self.trees {
                    total += tree.leaf_rate(&features)?;
                }
                Ok(total / self.trees.len() as f64)
            })
            .collect()
    }
}

struct TreeGrower<'a> {
    raw: &'a [Vec<f64>],
    labels: &'a [u8],
    config: &'a ForestConfig,
    features_per_split: usize,
    rng: Pcg64Mcg,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl TreeGrower<'_> {
    fn grow(&mut self, sample: Vec<usize>) -> DecisionTree {
        let mut nodes = Vec::new();
        self.grow_node(&mut nodes, sample, 0);
        DecisionTree { nodes }
    }

    fn grow_node(&mut self, nodes: &mut Vec<TreeNode>, sample: Vec<usize>, depth: usize) -> usize {
        let index = nodes.len();
        let positives = sample.iter().filter(|i| self.labels[**i] == 1).count();
        let positive_rate = positives as f64 / sample.len() as f64;
        nodes.push(TreeNode::Leaf { positive_rate });

        let pure = positives == 0 || positives == sample.len();
        if pure || depth >= self.config.max_depth || sample.len() < 2 * self.config.min_samples_leaf
        {
            return index;
        }
        let Some(split) = self.best_split(&sample, positives) else {
            return index;
        };

        let left = self.grow_node(nodes, split.left, depth + 1);
        let right = self.grow_node(nodes, split.right, depth + 1);
        nodes[index] = TreeNode::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        index
    }

    fn best_split(&mut self, sample: &[usize], positives: usize) -> Option<BestSplit> {
        let mut features: Vec<usize> = (0..MODEL_FEATURES.len()).collect();
        features.shuffle(&mut self.rng);
        features.truncate(self.features_per_split);

        let n = sample.len();
        let parent = gini(positives, n);
        let min_leaf = self.config.min_samples_leaf;
        let mut best: Option<(f64, usize, f64)> = None;

        for feature in features {
            let mut ordered: Vec<(f64, u8)> = sample
                .iter()
                .map(|i| (self.raw[*i][feature], self.labels[*i]))
                .collect();
            ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_positives = 0;
            for split_at in 1..n {
                left_positives += usize::from(ordered[split_at - 1].1);
                let (value, next) = (ordered[split_at - 1].0, ordered[split_at].0);
                if value == next || split_at < min_leaf || n - split_at < min_leaf {
                    continue;
                }
                let weighted = (split_at as f64 * gini(left_positives, split_at)
                    + (n - split_at) as f64 * gini(positives - left_positives, n - split_at))
                    / n as f64;
                let decrease = parent - weighted;
                if decrease > 0.0 && best.map_or(true, |(d, _, _)| decrease > d) {
                    let midpoint = value + (next - value) / 2.0;
                    let threshold = if midpoint < next { midpoint } else { value };
                    best = Some((decrease, feature, threshold));
                }
            }
        }

        let (_, feature, threshold) = best?;
        let (left, right) = sample
            .iter()
            .copied()
            .partition(|i| self.raw[*i][feature] <= threshold);
        Some(BestSplit {
            feature,
            threshold,
            left,
            right,
        })
    }
}

fn gini(positives: usize, total: usize) -> f64 {
    let p = positives as f64 / total as f64;
    2.0 * p * (1.0 - p)
}
