//! Property tests for DAG layering.

use proptest::prelude::*;
use serde_json::json;

use dagrun::core::{Task, TaskDAG, TaskId, TaskSpec};

/// Random acyclic task sets: every dependency points at a lower index.
fn acyclic_specs() -> impl Strategy<Value = Vec<TaskSpec>> {
    (1usize..20).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), n)
            .prop_map(|deps| {
                deps.into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let mut spec = TaskSpec::new(format!("t{:02}", i), json!("true"));
                        if i > 0 {
                            for pick in picks {
                                spec = spec.depends_on(format!("t{:02}", pick.index(i)));
                            }
                        }
                        spec
                    })
                    .collect()
            })
    })
}

fn build(specs: &[TaskSpec]) -> TaskDAG {
    TaskDAG::build(specs.iter().cloned().map(Task::from)).unwrap()
}

proptest! {
    #[test]
    fn every_task_is_layered_after_its_dependencies(specs in acyclic_specs()) {
        let dag = build(&specs);
        prop_assert!(dag.blocked().is_empty());
        let layered: usize = dag.layers().iter().map(Vec::len).sum();
        prop_assert_eq!(layered, specs.len());

        for spec in &specs {
            let layer = dag.layer_of(&spec.id).unwrap();
            for dep in &spec.dependencies {
                prop_assert!(dag.layer_of(dep).unwrap() < layer);
            }
            if spec.dependencies.is_empty() {
                prop_assert_eq!(layer, 0);
            }
        }
    }

    #[test]
    fn layering_ignores_submission_order(specs in acyclic_specs()) {
        let forward = build(&specs);
        let mut reversed = specs.clone();
        reversed.reverse();
        let backward = build(&reversed);
        prop_assert_eq!(forward.layers(), backward.layers());
    }

    #[test]
    fn layers_are_sorted_by_id(specs in acyclic_specs()) {
        let dag = build(&specs);
        for layer in dag.layers() {
            let mut sorted: Vec<TaskId> = layer.clone();
            sorted.sort();
            prop_assert_eq!(layer, &sorted);
        }
    }

    #[test]
    fn closing_a_cycle_blocks_only_downstream(specs in acyclic_specs()) {
        prop_assume!(specs.len() >= 2);
        let mut cyclic = specs.clone();
        let last = cyclic.len() - 1;
        cyclic[0] = cyclic[0].clone().depends_on(format!("t{:02}", last));
        cyclic[last] = cyclic[last].clone().depends_on("t00");
        let dag = build(&cyclic);

        prop_assert_eq!(dag.cycles().len(), 1);
        let layered: usize = dag.layers().iter().map(Vec::len).sum();
        prop_assert_eq!(layered + dag.blocked().len(), cyclic.len());
        prop_assert!(dag.blocked().contains_key(&TaskId::new("t00")));
    }
}
