//! End-to-end flows: integrate several batches and cluster the result,
//! or annotate a query from a labelled reference

use crate::anchors::*;
use crate::common::*;
use crate::community::*;
use crate::dataset::Dataset;
use crate::embedding::{BasisId, Embedding};
use crate::error::MungError;
use crate::integration::*;
use crate::neighbors::*;
use crate::projection::*;
use crate::transfer::*;

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct PipelineConfig {
    pub projection: ProjectionConfig,
    pub integration: IntegrationConfig,
    pub graph: GraphConfig,
    pub method: CommunityMethod,
    pub community: CommunityParams,
    /// tune the resolution towards this many clusters
    pub target_clusters: Option<usize>,
    /// smaller clusters are left unassigned
    pub min_cluster_size: usize,
}

impl PipelineConfig {
    pub fn new(rank: usize, min_score: f32, bandwidth: f32) -> Self {
        Self {
            projection: ProjectionConfig::with_rank(rank),
            integration: IntegrationConfig::new(min_score, bandwidth),
            graph: GraphConfig::exact(15),
            method: CommunityMethod::Louvain,
            community: CommunityParams::default(),
            target_clusters: None,
            min_cluster_size: 1,
        }
    }
}

/// What a run did, for persisting next to its outputs
#[derive(Clone, Debug, Serialize)]
pub struct RunRecord {
    pub batches: Vec<Box<str>>,
    pub basis: BasisId,
    pub config: PipelineConfig,
    pub integration: IntegrationReport,
    pub method: &'static str,
    pub resolution: f64,
    pub n_clusters: usize,
    pub modularity: f64,
}

pub struct ClusteringOutput {
    pub basis: ProjectionBasis,
    pub integration: IntegrationResult,
    /// corrected cells of all batches, in input order
    pub corrected: Embedding,
    pub graph: NeighborGraph,
    pub communities: Communities,
    pub record: RunRecord,
}

/// project → align → anchors → correct → SNN graph → communities
pub fn integrate_and_cluster(
    datasets: &[&Dataset],
    config: &PipelineConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<ClusteringOutput> {
    //////////////////////////////////////
    // step 1: shared projection        //
    //////////////////////////////////////

    let (basis, embeddings) = project_datasets(datasets, &config.projection)?;
    interrupt.check()?;

    //////////////////////////////////////
    // step 2: anchors and correction   //
    //////////////////////////////////////

    let integration = integrate_datasets(
        &embeddings.iter().collect::<Vec<_>>(),
        &config.integration,
        interrupt,
    )?;
    let corrected = integration.corrected_in_input_order("corrected")?;

    //////////////////////////////////////
    // step 3: graph and communities    //
    //////////////////////////////////////

    let graph = build_graph(&corrected, &config.graph, interrupt)?;
    let weighted = WeightedGraph::from_knn_graph(&graph.graph)?;

    info!(
        "SNN graph: {} nodes, {} edges, {} component(s)",
        weighted.num_nodes(),
        weighted.num_edges(),
        count_components(&weighted)
    );

    let detector = config.method.detector();
    let mut communities = match config.target_clusters {
        Some(k) => tune_resolution(&weighted, detector.as_ref(), k, &config.community, interrupt)?,
        None => detector.detect(&weighted, &config.community, interrupt)?,
    };

    if config.min_cluster_size > 1 {
        communities.result.remove_small_clusters(config.min_cluster_size);
    }

    info!("\n{}", communities.result.histogram_ascii(50, 20));

    let record = RunRecord {
        batches: datasets.iter().map(|d| d.batch().into()).collect(),
        basis: basis.id,
        config: config.clone(),
        integration: integration.report.clone(),
        method: detector.name(),
        resolution: communities.resolution,
        n_clusters: communities.result.n_clusters,
        modularity: communities.modularity,
    };

    Ok(ClusteringOutput {
        basis,
        integration,
        corrected,
        graph,
        communities,
        record,
    })
}

/// How reference and query are embedded together
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
pub enum JointSpace {
    /// PCA of the reference; the query is projected into it
    #[default]
    ReferencePca,
    /// canonical correlation of the pair
    Cca,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnnotationConfig {
    pub projection: ProjectionConfig,
    pub space: JointSpace,
    pub align: AlignConfig,
    pub anchors: AnchorConfig,
    pub transfer: TransferConfig,
}

impl AnnotationConfig {
    pub fn new(rank: usize, min_score: f32, bandwidth: f32) -> Self {
        Self {
            projection: ProjectionConfig::with_rank(rank),
            space: JointSpace::ReferencePca,
            align: AlignConfig::default(),
            anchors: AnchorConfig::new(min_score),
            transfer: TransferConfig::with_bandwidth(bandwidth),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AnnotationRecord {
    pub reference: Box<str>,
    pub query: Box<str>,
    pub basis: BasisId,
    pub config: AnnotationConfig,
    pub candidates: usize,
    pub anchors: usize,
    pub mean_score: f32,
    pub unassigned: usize,
}

#[derive(Debug)]
pub struct AnnotationOutput {
    pub anchors: AnchorSet,
    pub transfer: LabelTransfer,
    pub record: AnnotationRecord,
}

/// embed → align → anchors → label transfer
pub fn annotate(
    reference: &Dataset,
    query: &Dataset,
    config: &AnnotationConfig,
    interrupt: &Interrupt,
) -> anyhow::Result<AnnotationOutput> {
    let labels = reference
        .annotation()
        .ok_or_else(|| MungError::invalid("reference", format!("'{}' carries no annotation", reference.batch())))?;
    reference.ensure_same_features(query)?;

    let (ref_emb, query_emb) = match config.space {
        JointSpace::ReferencePca => {
            let (basis, mut embeddings) = project_datasets(&[reference], &config.projection)?;
            let query_emb = basis.project(query)?;
            (embeddings.remove(0), query_emb)
        }
        JointSpace::Cca => canonical_correlation(reference, query, &config.projection)?,
    };
    interrupt.check()?;

    let aligned = align_embeddings(&[&ref_emb, &query_emb], &config.align)?;
    let anchors = find_anchors(&aligned[0], &aligned[1], &config.anchors, interrupt)?;
    let transfer = transfer_labels(&ref_emb, labels, &query_emb, &anchors, &config.transfer, interrupt)?;

    let record = AnnotationRecord {
        reference: reference.batch().into(),
        query: query.batch().into(),
        basis: ref_emb.basis(),
        config: config.clone(),
        candidates: anchors.num_candidates(),
        anchors: anchors.len(),
        mean_score: anchors.mean_score(),
        unassigned: transfer.num_unassigned(),
    };

    Ok(AnnotationOutput {
        anchors,
        transfer,
        record,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_requires_reference_labels() {
        let data = Mat::from_fn(10, 3, |i, j| (i * 3 + j) as f32);
        let reference = Dataset::from_matrix("r", data.clone()).unwrap();
        let query = Dataset::from_matrix("q", data).unwrap();
        let config = AnnotationConfig::new(2, 0.1, 1.0);
        let err = annotate(&reference, &query, &config, &Interrupt::default()).unwrap_err();
        assert!(matches!(MungError::of(&err), Some(MungError::InvalidParameter { name: "reference", .. })));
    }

    #[test]
    fn record_serializes() {
        let config = PipelineConfig::new(10, 0.2, 1.5);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"rank\":10"));
        assert!(json.contains("\"Louvain\""));
    }
}
