//! Load balancer (spec §4.3, component C3): eight selection policies over
//! a set of [`NodeConfig`]s, fed by per-node [`NodeStats`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rand::Rng;

use crate::types::{NodeConfig, NodeStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
	#[default]
	RoundRobin,
	WeightedRoundRobin,
	LeastConnections,
	LeastLatency,
	Random,
	WeightedRandom,
	HealthBased,
	IpHash,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BalancerError {
	#[error("no healthy nodes available")]
	NoHealthyNodes,
}

#[derive(Debug, Clone, Copy)]
struct NodeScore {
	stats: NodeStats,
	health_score: f64,
	weighted_score: f64,
}

impl Default for NodeScore {
	fn default() -> Self {
		Self { stats: NodeStats::default(), health_score: 100.0, weighted_score: 100.0 }
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SelectContext {
	pub client_ip: Option<std::net::IpAddr>,
}

pub struct LoadBalancer {
	algorithm: Algorithm,
	scores: RwLock<HashMap<String, NodeScore>>,
	round_robin_index: AtomicUsize,
}

impl LoadBalancer {
	pub fn new(algorithm: Algorithm) -> Self {
		Self { algorithm, scores: RwLock::new(HashMap::new()), round_robin_index: AtomicUsize::new(0) }
	}

	/// Recomputes `healthScore`/`weightedScore` for a node (spec §4.3 Scoring).
	pub fn update_stats(&self, node_id: &str, stats: NodeStats) {
		let health_score = health_score(&stats);
		let weighted_score = weighted_score(&stats, health_score);
		let mut scores = self.scores.write();
		scores.insert(node_id.to_string(), NodeScore { stats, health_score, weighted_score });
	}

	fn health_score_of(&self, node_id: &str) -> Option<f64> {
		self.scores.read().get(node_id).map(|s| s.health_score)
	}

	/// Selects a node from `nodes`, per spec §4.3 `Select`.
	pub fn select<'a>(
		&self,
		nodes: &'a [NodeConfig],
		ctx: &SelectContext,
	) -> Result<&'a NodeConfig, BalancerError> {
		let mut candidates: Vec<&NodeConfig> = nodes
			.iter()
			.filter(|n| n.selectable())
			.filter(|n| match self.health_score_of(&n.id) {
				None => true,
				Some(score) => score >= 50.0,
			})
			.collect();

		if candidates.is_empty() {
			tracing::warn!("no nodes passed health gating, falling back to all nodes");
			candidates = nodes.iter().filter(|n| n.selectable()).collect();
		}
		if candidates.is_empty() {
			return Err(BalancerError::NoHealthyNodes);
		}

		let chosen = match self.algorithm {
			Algorithm::RoundRobin => self.round_robin(&candidates),
			Algorithm::WeightedRoundRobin => self.weighted_round_robin(&candidates),
			Algorithm::LeastConnections => self.least_connections(&candidates),
			Algorithm::LeastLatency => self.least_latency(&candidates),
			Algorithm::Random => self.random(&candidates),
			Algorithm::WeightedRandom => self.weighted_random(&candidates),
			Algorithm::HealthBased => self.health_based(&candidates),
			Algorithm::IpHash => self.ip_hash(&candidates, ctx),
		};
		Ok(chosen)
	}

	fn round_robin<'a>(&self, candidates: &[&'a NodeConfig]) -> &'a NodeConfig {
		let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % candidates.len();
		candidates[idx]
	}

	fn weighted_round_robin<'a>(&self, candidates: &[&'a NodeConfig]) -> &'a NodeConfig {
		let mut expanded: Vec<&NodeConfig> = Vec::new();
		for n in candidates {
			let health = self.health_score_of(&n.id).unwrap_or(100.0);
			let weight = (1 + (health / 10.0) as i64).clamp(1, 10) as usize;
			for _ in 0..weight {
				expanded.push(n);
			}
		}
		let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % expanded.len();
		expanded[idx]
	}

	fn least_connections<'a>(&self, candidates: &[&'a NodeConfig]) -> &'a NodeConfig {
		let scores = self.scores.read();
		*candidates
			.iter()
			.min_by_key(|n| scores.get(&n.id as &str).map(|s| s.stats.active_connections).unwrap_or(0))
			.expect("candidates is non-empty")
	}

	fn least_latency<'a>(&self, candidates: &[&'a NodeConfig]) -> &'a NodeConfig {
		let scores = self.scores.read();
		*candidates
			.iter()
			.min_by(|a, b| {
				let la = scores.get(&a.id as &str).map(|s| s.stats.latency_ms).unwrap_or(0.0);
				let lb = scores.get(&b.id as &str).map(|s| s.stats.latency_ms).unwrap_or(0.0);
				la.total_cmp(&lb)
			})
			.expect("candidates is non-empty")
	}

	fn random<'a>(&self, candidates: &[&'a NodeConfig]) -> &'a NodeConfig {
		let idx = rand::rng().random_range(0..candidates.len());
		candidates[idx]
	}

	fn weighted_random<'a>(&self, candidates: &[&'a NodeConfig]) -> &'a NodeConfig {
		let total: u64 = candidates.iter().map(|n| n.weight.max(1) as u64).sum();
		let mut pick = rand::rng().random_range(0..total);
		for n in candidates {
			let w = n.weight.max(1) as u64;
			if pick < w {
				return n;
			}
			pick -= w;
		}
		candidates[candidates.len() - 1]
	}

	fn health_based<'a>(&self, candidates: &[&'a NodeConfig]) -> &'a NodeConfig {
		let scores = self.scores.read();
		*candidates
			.iter()
			.max_by(|a, b| {
				let ha = scores.get(&a.id as &str).map(|s| s.health_score).unwrap_or(100.0);
				let hb = scores.get(&b.id as &str).map(|s| s.health_score).unwrap_or(100.0);
				ha.total_cmp(&hb)
			})
			.expect("candidates is non-empty")
	}

	fn ip_hash<'a>(&self, candidates: &[&'a NodeConfig], ctx: &SelectContext) -> &'a NodeConfig {
		let Some(ip) = ctx.client_ip else {
			return self.random(candidates);
		};
		let mut hash: u64 = 0;
		for byte in ip.to_string().bytes() {
			hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
		}
		candidates[(hash as usize) % candidates.len()]
	}
}

/// `healthScore` computation (spec §4.3 Scoring).
fn health_score(stats: &NodeStats) -> f64 {
	let mut score = 100.0;
	score -= 10.0 * stats.error_rate_pct;
	if stats.cpu_pct > 80.0 {
		score -= 2.0 * (stats.cpu_pct - 80.0);
	}
	if stats.mem_pct > 80.0 {
		score -= 2.0 * (stats.mem_pct - 80.0);
	}
	if stats.latency_ms > 100.0 {
		score -= (stats.latency_ms - 100.0) / 10.0;
	}
	if stats.load > 2.0 {
		score -= 10.0 * (stats.load - 2.0);
	}
	score.clamp(0.0, 100.0)
}

/// `weightedScore` computation (spec §4.3 Scoring).
fn weighted_score(stats: &NodeStats, health_score: f64) -> f64 {
	let conn_score = (100.0 - (stats.active_connections as f64)).clamp(0.0, 100.0);
	let latency_score = (100.0 - stats.latency_ms / 10.0).clamp(0.0, 100.0);
	let error_score = (100.0 - stats.error_rate_pct).clamp(0.0, 100.0);
	let resource_score = health_score;
	0.3 * conn_score + 0.3 * latency_score + 0.2 * error_score + 0.2 * resource_score
}
