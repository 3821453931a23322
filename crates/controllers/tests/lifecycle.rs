//! End-to-end synthesis lifecycle scenarios against the in-memory store.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use common::{configmap, eventually_true, Harness};
use eno_controllers::{FnExecutor, ResourceList};
use eno_store::{keys, meta, Selector};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cold_create_synthesizes_and_reconciles() {
    let harness = Harness::start(Arc::new(FnExecutor(|_s: &eno_core::api::Synthesizer, _c: &eno_core::api::Composition, _in: &ResourceList| {
        Ok(ResourceList::of(vec![configmap("test")]))
    })))
    .await;

    harness.create_synthesizer("test-syn", "img:1").await;
    harness.create_composition("test-comp", "test-syn").await;

    let comp = harness
        .eventually_comp("test-comp", |c| {
            c.status
                .current_synthesis
                .as_ref()
                .map(|s| s.synthesized() && !s.resource_slices.is_empty())
                .unwrap_or(false)
        })
        .await;
    let current = comp.status.current_synthesis.as_ref().unwrap();
    assert!(current.initialized.is_some(), "initialized timestamp is set");
    assert!(current.pod_creation.is_some(), "pod creation timestamp is set");
    assert_eq!(current.observed_composition_generation, comp.metadata.generation);

    // The synthesized resource lands in the store.
    assert!(
        eventually_true(|| async {
            harness.store.get("v1/ConfigMap", Some("default"), "test").await.unwrap().is_some()
        })
        .await,
        "configmap was created"
    );

    // And the rollups eventually stamp the synthesis.
    harness
        .eventually_comp("test-comp", |c| {
            let s = c.status.current_synthesis.as_ref().unwrap();
            s.reconciled.is_some() && s.ready.is_some()
        })
        .await;

    // Exactly one worker pod, and it is collected after delivery.
    assert!(
        eventually_true(|| async {
            let pods = harness.store.list(keys::POD, Some("default"), &Selector::new()).await.unwrap();
            pods.is_empty()
        })
        .await,
        "worker pod collected after synthesis"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_bump_resynthesizes_and_collects_old_slices() {
    let flip = Arc::new(AtomicBool::new(false));
    let flip_exec = Arc::clone(&flip);
    let harness = Harness::start(Arc::new(FnExecutor(move |_s: &eno_core::api::Synthesizer, _c: &eno_core::api::Composition, _in: &ResourceList| {
        let name = if flip_exec.load(Ordering::SeqCst) { "after" } else { "before" };
        Ok(ResourceList::of(vec![configmap(name)]))
    })))
    .await;

    harness.create_synthesizer("test-syn", "img:1").await;
    harness.create_composition("test-comp", "test-syn").await;

    let comp = harness
        .eventually_comp("test-comp", |c| {
            c.status.current_synthesis.as_ref().map(|s| s.reconciled.is_some()).unwrap_or(false)
        })
        .await;
    let first = comp.status.current_synthesis.as_ref().unwrap();
    let first_uuid = first.uuid.clone();
    let first_slices: Vec<String> = first.resource_slices.iter().map(|r| r.name.clone()).collect();

    // Mutate the spec; generation bumps and a fresh synthesis rotates in.
    flip.store(true, Ordering::SeqCst);
    let mut updated = harness.composition("test-comp").await.unwrap();
    updated.spec.synthesis_env.push(eno_core::api::EnvVar { name: "X".into(), value: "1".into() });
    harness
        .store
        .update(keys::COMPOSITION, eno_core::api::to_value(&updated))
        .await
        .unwrap();

    let comp = harness
        .eventually_comp("test-comp", |c| {
            c.status
                .current_synthesis
                .as_ref()
                .map(|s| s.uuid != first_uuid && s.reconciled.is_some())
                .unwrap_or(false)
        })
        .await;
    let second = comp.status.current_synthesis.as_ref().unwrap();
    assert!(second.observed_composition_generation > 1);

    // The new output exists; the first synthesis's slices are collected
    // once the new synthesis has fully reconciled.
    assert!(
        eventually_true(|| async {
            harness.store.get("v1/ConfigMap", Some("default"), "after").await.unwrap().is_some()
        })
        .await
    );
    for name in first_slices {
        assert!(
            eventually_true(|| async {
                harness
                    .store
                    .get(keys::RESOURCE_SLICE, Some("default"), &name)
                    .await
                    .unwrap()
                    .is_none()
            })
            .await,
            "stale slice collected"
        );
    }
    harness
        .eventually_comp("test-comp", |c| c.status.previous_synthesis.is_none())
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_tears_down_and_releases_finalizer() {
    let harness = Harness::start(Arc::new(FnExecutor(|_s: &eno_core::api::Synthesizer, _c: &eno_core::api::Composition, _in: &ResourceList| {
        Ok(ResourceList::of(vec![configmap("doomed")]))
    })))
    .await;

    harness.create_synthesizer("test-syn", "img:1").await;
    harness.create_composition("test-comp", "test-syn").await;

    harness
        .eventually_comp("test-comp", |c| {
            c.status.current_synthesis.as_ref().map(|s| s.reconciled.is_some()).unwrap_or(false)
        })
        .await;
    assert!(harness.store.get("v1/ConfigMap", Some("default"), "doomed").await.unwrap().is_some());

    let comp = harness.composition("test-comp").await.unwrap();
    let delete_generation = comp.metadata.generation;
    harness
        .store
        .delete(keys::COMPOSITION, Some("default"), "test-comp", None)
        .await
        .unwrap();

    // Status observes the deletion before anything is released.
    harness
        .eventually_comp("test-comp", |c| {
            c.deleting()
                && c.status
                    .current_synthesis
                    .as_ref()
                    .map(|s| s.observed_composition_generation >= delete_generation)
                    .unwrap_or(false)
        })
        .await;

    // Managed objects go, then slices, then the finalizer.
    assert!(
        eventually_true(|| async {
            harness.store.get("v1/ConfigMap", Some("default"), "doomed").await.unwrap().is_none()
        })
        .await,
        "managed object torn down"
    );
    assert!(
        eventually_true(|| async { harness.composition("test-comp").await.is_none() }).await,
        "composition released"
    );
    let slices = harness
        .store
        .list(keys::RESOURCE_SLICE, Some("default"), &Selector::new())
        .await
        .unwrap();
    assert!(slices.is_empty(), "no slices survive the composition");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_synthesizer_releases_finalizer_immediately() {
    // The synthesizer never produces output, so no synthesis completes.
    let harness = Harness::start(Arc::new(FnExecutor(|_s: &eno_core::api::Synthesizer, _c: &eno_core::api::Composition, _in: &ResourceList| {
        Err(anyhow!("synthesizer crashed"))
    })))
    .await;

    harness.create_synthesizer("test-syn", "img:1").await;
    harness.create_composition("test-comp", "test-syn").await;

    // Wait for the state machine to take hold of the composition.
    harness
        .eventually_comp("test-comp", |c| {
            c.metadata.has_finalizer(eno_core::api::CLEANUP_FINALIZER)
                && c.status.in_flight_synthesis.is_some()
        })
        .await;

    harness.store.delete(keys::SYNTHESIZER, Some("default"), "test-syn", None).await.unwrap();
    harness.store.delete(keys::COMPOSITION, Some("default"), "test-comp", None).await.unwrap();

    assert!(
        eventually_true(|| async { harness.composition("test-comp").await.is_none() }).await,
        "finalizer released without a completed synthesis"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleted_referenced_slice_forces_resynthesis() {
    let harness = Harness::start(Arc::new(FnExecutor(|_s: &eno_core::api::Synthesizer, _c: &eno_core::api::Composition, _in: &ResourceList| {
        Ok(ResourceList::of(vec![configmap("test")]))
    })))
    .await;

    harness.create_synthesizer("test-syn", "img:1").await;
    harness.create_composition("test-comp", "test-syn").await;

    let comp = harness
        .eventually_comp("test-comp", |c| {
            c.status.current_synthesis.as_ref().map(|s| s.reconciled.is_some()).unwrap_or(false)
        })
        .await;
    let first = comp.status.current_synthesis.as_ref().unwrap();
    let first_uuid = first.uuid.clone();
    let slice_name = first.resource_slices[0].name.clone();

    // Someone deletes a slice the current synthesis still references.
    harness
        .store
        .delete(keys::RESOURCE_SLICE, Some("default"), &slice_name, None)
        .await
        .unwrap();

    // A fresh synthesis replaces it and materializes new slices.
    let comp = harness
        .eventually_comp("test-comp", |c| {
            c.status
                .current_synthesis
                .as_ref()
                .map(|s| s.uuid != first_uuid && s.synthesized())
                .unwrap_or(false)
        })
        .await;
    let second = comp.status.current_synthesis.as_ref().unwrap();
    assert!(!second.resource_slices.is_empty());
    let recreated = harness
        .store
        .get(keys::RESOURCE_SLICE, Some("default"), &second.resource_slices[0].name)
        .await
        .unwrap();
    assert!(recreated.is_some(), "slices re-materialized");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_pods_carry_the_contract_metadata() {
    // An executor that never answers keeps the pod around to inspect.
    let harness = Harness::start(Arc::new(FnExecutor(|_s: &eno_core::api::Synthesizer, _c: &eno_core::api::Composition, _in: &ResourceList| {
        Err(anyhow!("hold"))
    })))
    .await;

    harness.create_synthesizer("test-syn", "img:1").await;
    harness.create_composition("test-comp", "test-syn").await;

    let comp = harness
        .eventually_comp("test-comp", |c| {
            c.status
                .in_flight_synthesis
                .as_ref()
                .map(|s| s.pod_creation.is_some())
                .unwrap_or(false)
        })
        .await;
    let uuid = comp.status.in_flight_synthesis.as_ref().unwrap().uuid.clone();

    let pods = harness
        .store
        .list(
            keys::POD,
            Some("default"),
            &Selector::new()
                .with(eno_core::api::COMPOSITION_NAME_LABEL, "test-comp")
                .with(eno_core::api::COMPOSITION_NAMESPACE_LABEL, "default"),
        )
        .await
        .unwrap();
    assert_eq!(pods.len(), 1, "at most one live worker pod");
    let pod = &pods[0];
    assert_eq!(meta::label(pod, eno_core::api::SYNTHESIS_UUID_LABEL), Some(uuid.as_str()));
    assert_eq!(
        meta::annotation(pod, eno_core::api::COMPOSITION_GENERATION_ANNOTATION),
        Some(comp.metadata.generation.to_string().as_str()),
    );
}
