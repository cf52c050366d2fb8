//! Integration test: search graph → architecture weights → discretize → evaluate

use std::path::PathBuf;
use std::sync::Arc;

use kolosal_nas::nas::{
    select_edges, ArchitectureEvaluator, DartsArchOptimizer, EdgeOp, EdgeWeights, EvaluationConfig, GraphTopology,
    MacroGraph, NoneRanking, OpArgs, Operation, OperationRegistry, SearchConfig, Tensor, DARTS_PRIMITIVES, NONE_OP,
};
use kolosal_nas::KolosalError;
use ndarray::Array1;

fn small_config() -> SearchConfig {
    SearchConfig::default()
        .with_channels(4)
        .with_layers(3)
        .with_steps(3)
        .with_input_size(8)
}

fn configs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("configs")
}

#[test]
fn test_shipped_configs_load() {
    let search = SearchConfig::from_file(configs_dir().join("default.json")).unwrap();
    let registry = OperationRegistry::darts();
    search.validate_against(&registry).unwrap();
    assert_eq!(search.primitives.len(), DARTS_PRIMITIVES.len());

    let final_eval = SearchConfig::from_file(configs_dir().join("final_eval.json")).unwrap();
    assert_eq!(final_eval.steps, search.steps);
    assert_eq!(final_eval.input_edge_policy(), vec![2; final_eval.steps]);
}

#[test]
fn test_search_then_discretize() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(OperationRegistry::darts());
    let config = small_config().with_primitives(&DARTS_PRIMITIVES);

    let graph = MacroGraph::from_config(&config, dir.path().join("graph.json"), Arc::clone(&registry)).unwrap();
    let mut optimizer = DartsArchOptimizer::default();
    graph.parse(&mut optimizer);

    // push every edge towards sep_conv_3x3, later edges more strongly
    let grads: Vec<Array1<f64>> = optimizer
        .arch_weights()
        .iter()
        .enumerate()
        .map(|(i, handle)| {
            let mut g = Array1::zeros(handle.read().len());
            g[4] = -1000.0 * (1.0 + i as f64);
            g
        })
        .collect();
    optimizer.step(&grads).unwrap();

    let child = graph.discretize(&config, &[2, 2, 2]).unwrap();
    drop(graph);

    assert!(child.is_discrete());
    for cell in child.cells() {
        for node in cell.inter_nodes() {
            assert_eq!(node.num_input_edges(), 2);
            let expected: Vec<usize> = vec![node.index() - 2, node.index() - 1];
            assert_eq!(node.input_edges(), expected);
            for edge in node.edges() {
                match &edge.op {
                    EdgeOp::Fixed { name, .. } => assert_eq!(name, "sep_conv_3x3"),
                    EdgeOp::Mixed(_) => panic!("mixed edge survived discretization"),
                }
            }
        }
    }

    let x = Tensor::from_elem((2, 3, 8, 8), 0.25);
    assert_eq!(child.forward(&x).unwrap().dim(), (2, 10));
}

#[test]
fn test_topology_roundtrip_rebuilds_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("search").join("graph.json");
    let registry = Arc::new(OperationRegistry::nas_bench_201());
    let graph = MacroGraph::from_config(&small_config(), &path, Arc::clone(&registry)).unwrap();
    let child = graph.discretize(&small_config(), &[1, 2, 3]).unwrap();

    let final_path = dir.path().join("final_graph.json");
    child.save_topology(&final_path).unwrap();
    let loaded = GraphTopology::load(&final_path).unwrap();
    assert_eq!(&loaded, child.topology());

    let rebuilt = MacroGraph::from_topology(&small_config(), registry, loaded).unwrap();
    assert!(rebuilt.is_discrete());
    assert_eq!(rebuilt.num_parameters(), child.num_parameters());
    let x = Tensor::from_shape_fn((1, 3, 8, 8), |(_, c, i, j)| (c + i * 8 + j) as f64 / 64.0);
    assert_eq!(rebuilt.forward(&x).unwrap(), child.forward(&x).unwrap());
}

#[test]
fn test_none_ranking_policies_differ() {
    let ops = ["none", "skip_connect", "nor_conv_3x3"];
    let edges = vec![
        EdgeWeights::new(&ops, vec![0.1, 0.6, 0.3]),
        EdgeWeights::new(&ops, vec![0.95, 0.03, 0.02]),
        EdgeWeights::new(&ops, vec![0.2, 0.5, 0.3]),
    ];
    let exclude = select_edges(&edges, 1, NoneRanking::Exclude).unwrap();
    let include = select_edges(&edges, 1, NoneRanking::Include).unwrap();
    assert_eq!(exclude[0].edge, 0);
    assert_eq!(include[0].edge, 1);
    assert_ne!(include[0].op, NONE_OP);
}

#[test]
fn test_spec_scenario_three_edges() {
    let ops = ["none", "nor_conv_3x3"];
    let edges: Vec<EdgeWeights> = [0.1, 0.7, 0.4]
        .iter()
        .map(|&w| EdgeWeights::new(&ops, vec![1.0 - w, w]))
        .collect();
    let kept = select_edges(&edges, 2, NoneRanking::Exclude).unwrap();
    assert_eq!(kept.iter().map(|c| c.edge).collect::<Vec<_>>(), vec![1, 2]);
}

#[test]
fn test_custom_registry_entry() {
    let mut registry = OperationRegistry::nas_bench_201();
    registry
        .register("identity_only", |args: &OpArgs| -> kolosal_nas::Result<Operation> {
            if args.stride != 1 || args.c_in != args.c_out {
                return Err(KolosalError::InvalidStride {
                    op: "identity_only".to_string(),
                    stride: args.stride,
                });
            }
            Ok(Operation::Identity)
        })
        .unwrap();
    assert!(matches!(
        registry.register("identity_only", |_: &OpArgs| Ok(Operation::Identity)),
        Err(KolosalError::AlreadyRegistered(_))
    ));

    // reduction cells need stride 2 on their input edges
    let config = small_config().with_primitives(&["none", "identity_only"]);
    let err = MacroGraph::new(&config, Arc::new(registry.clone())).unwrap_err();
    assert!(matches!(err, KolosalError::InvalidStride { .. }));

    let shallow = config.with_layers(2);
    let graph = MacroGraph::new(&shallow, Arc::new(registry)).unwrap();
    assert_eq!(graph.num_cells(), 2);
}

#[test]
fn test_evaluator_on_discrete_child() {
    let registry = Arc::new(OperationRegistry::nas_bench_201());
    let graph = MacroGraph::new(&small_config(), registry).unwrap();
    let child = graph.discretize(&small_config().with_layers(4), &[2, 2, 2]).unwrap();
    let mut evaluator = ArchitectureEvaluator::new(EvaluationConfig::from(&small_config()));
    let result = evaluator.evaluate(&child).unwrap();
    assert_eq!(result.output_shape, vec![2, 10]);
    assert_eq!(result.num_params, child.num_parameters());
    assert!(result.forward_time >= 0.0);
}
