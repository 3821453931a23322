//! Symphony replication: one composition per variation, convergence on
//! variation changes, finalizer-gated teardown.

mod common;

use std::sync::Arc;

use common::{eventually_true, Harness};
use eno_controllers::symphony::SYMPHONY_NAME_LABEL;
use eno_controllers::{FnExecutor, ResourceList};
use eno_core::api::{self, Composition, Symphony, Synthesizer, SynthesizerRef, Variation};
use eno_store::{get_as, keys, Selector};

async fn members(harness: &Harness, symphony: &str) -> Vec<Composition> {
    harness
        .store
        .list(
            keys::COMPOSITION,
            Some("default"),
            &Selector::new().with(SYMPHONY_NAME_LABEL, symphony),
        )
        .await
        .unwrap()
        .into_iter()
        .map(|v| api::from_value(v).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn variations_fan_out_and_converge() {
    let harness = Harness::start(Arc::new(FnExecutor(
        |_s: &Synthesizer, _c: &Composition, _in: &ResourceList| Ok(ResourceList::of(vec![])),
    )))
    .await;

    let mut symphony = Symphony {
        api_version: api::API_VERSION.into(),
        kind: Symphony::KIND.into(),
        ..Default::default()
    };
    symphony.metadata.name = "sym".into();
    symphony.metadata.namespace = "default".into();
    symphony.spec.variations = vec![
        Variation { synthesizer: SynthesizerRef { name: "a".into() }, ..Default::default() },
        Variation { synthesizer: SynthesizerRef { name: "b".into() }, ..Default::default() },
    ];
    harness.store.create(keys::SYMPHONY, api::to_value(&symphony)).await.unwrap();

    assert!(
        eventually_true(|| async { members(&harness, "sym").await.len() == 2 }).await,
        "one composition per variation"
    );
    let comps = members(&harness, "sym").await;
    for comp in &comps {
        assert_eq!(comp.metadata.controller_owner().unwrap().kind, Symphony::KIND);
        assert!(["a", "b"].contains(&comp.spec.synthesizer.name.as_str()));
    }

    // Status indexes the member synthesizers, sorted.
    assert!(
        eventually_true(|| async {
            get_as::<Symphony>(harness.store.as_ref(), keys::SYMPHONY, Some("default"), "sym")
                .await
                .unwrap()
                .map(|s| {
                    s.status.synthesizers
                        == vec![
                            SynthesizerRef { name: "a".into() },
                            SynthesizerRef { name: "b".into() },
                        ]
                })
                .unwrap_or(false)
        })
        .await
    );

    // Dropping a variation deletes its member.
    let mut latest =
        get_as::<Symphony>(harness.store.as_ref(), keys::SYMPHONY, Some("default"), "sym")
            .await
            .unwrap()
            .unwrap();
    latest.spec.variations.truncate(1);
    harness.store.update(keys::SYMPHONY, api::to_value(&latest)).await.unwrap();

    assert!(
        eventually_true(|| async {
            let comps = members(&harness, "sym").await;
            comps.len() == 1 && comps[0].spec.synthesizer.name == "a"
        })
        .await,
        "member without a variation is pruned"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn symphony_deletion_waits_for_members() {
    let harness = Harness::start(Arc::new(FnExecutor(
        |_s: &Synthesizer, _c: &Composition, _in: &ResourceList| Ok(ResourceList::of(vec![])),
    )))
    .await;

    // The synthesizer exists so members complete a synthesis and hold
    // finalizers of their own.
    harness.create_synthesizer("a", "img:1").await;

    let mut symphony = Symphony {
        api_version: api::API_VERSION.into(),
        kind: Symphony::KIND.into(),
        ..Default::default()
    };
    symphony.metadata.name = "sym".into();
    symphony.metadata.namespace = "default".into();
    symphony.spec.variations =
        vec![Variation { synthesizer: SynthesizerRef { name: "a".into() }, ..Default::default() }];
    harness.store.create(keys::SYMPHONY, api::to_value(&symphony)).await.unwrap();

    assert!(eventually_true(|| async { members(&harness, "sym").await.len() == 1 }).await);
    assert!(
        eventually_true(|| async {
            members(&harness, "sym")
                .await
                .first()
                .and_then(|c| c.status.current_synthesis.as_ref().map(|s| s.synthesized()))
                .unwrap_or(false)
        })
        .await,
        "member synthesizes"
    );

    harness.store.delete(keys::SYMPHONY, Some("default"), "sym", None).await.unwrap();

    assert!(
        eventually_true(|| async { members(&harness, "sym").await.is_empty() }).await,
        "members deleted first"
    );
    assert!(
        eventually_true(|| async {
            get_as::<Symphony>(harness.store.as_ref(), keys::SYMPHONY, Some("default"), "sym")
                .await
                .unwrap()
                .is_none()
        })
        .await,
        "symphony released after members are gone"
    );
}
