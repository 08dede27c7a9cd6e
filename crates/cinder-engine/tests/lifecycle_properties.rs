//! Engine lifecycle properties.
//!
//! Exercises `EngineManager` end-to-end: policy selection against the
//! cache, binding cleanup, stream restoration and the refresh scenario.

use cinder_engine::{
    Binding, BindingInjector, CaptureBuffer, EngineCache, EngineError, EngineFactory,
    EngineManager, EngineOptions, ExecutionContext, LuaEngineFactory, OutputStream, ScriptEngine,
};
use cinder_types::{CacheKey, CommandInfo, EnginePolicy};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn command(extension: &str) -> CommandInfo {
    CommandInfo::new("Sample", "/ext/Sample.pushbutton/script.lua")
        .with_bundle("Sample.pushbutton")
        .with_extension(extension)
        .with_unique_id(format!("{extension}-sample"))
}

fn ctx(extension: &str, policy: EnginePolicy) -> ExecutionContext {
    ExecutionContext::builder(command(extension))
        .policy(policy)
        .output(OutputStream::sink())
        .build()
}

/// Factory counting how many engines it created.
#[derive(Default)]
struct CountingFactory {
    created: Arc<AtomicUsize>,
    inner: LuaEngineFactory,
}

impl EngineFactory for CountingFactory {
    fn create(&self, options: &EngineOptions) -> Result<ScriptEngine, EngineError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.inner.create(options)
    }
}

// ─── Cache invariants per policy ────────────────────────────────────

#[test]
fn isolation_and_clean_never_touch_cache() {
    let manager = EngineManager::new();
    let warm = manager.acquire(ctx("a", EnginePolicy::Reuse)).expect("warm");
    let cached_id = warm.engine().id();
    warm.release().expect("release");

    for policy in [EnginePolicy::FullIsolation, EnginePolicy::Clean] {
        for ext in ["a", "b"] {
            let inv = manager.acquire(ctx(ext, policy)).expect("acquire");
            let id = inv.engine().id();
            inv.release().expect("release");

            assert_eq!(manager.cache().len(), 1, "{policy} changed cache size");
            assert!(
                manager
                    .cache()
                    .keys()
                    .iter()
                    .all(|k| manager.cached_engine(k).expect("entry").id() != id),
                "{policy} engine ended up in the cache"
            );
        }
    }
    assert_eq!(
        manager.cached_engine(&CacheKey::new("a")).expect("a").id(),
        cached_id
    );
}

#[test]
fn refresh_always_stores_new_engine() {
    let manager = EngineManager::new();
    let key = CacheKey::new("a");

    let mut previous = None;
    for _ in 0..3 {
        let inv = manager.acquire(ctx("a", EnginePolicy::Refresh)).expect("refresh");
        let id = inv.engine().id();
        assert_eq!(manager.cached_engine(&key).expect("entry").id(), id);
        assert_ne!(Some(id), previous);
        previous = Some(id);
        inv.release().expect("release");
    }
}

#[test]
fn default_policy_reuses_and_reports_cached_flag() {
    let manager = EngineManager::new();

    let first = manager.acquire(ctx("a", EnginePolicy::Reuse)).expect("first");
    let first_flag: bool =
        BindingInjector::binding(first.engine(), Binding::CachedEngine).expect("flag");
    let first_id = first.engine().id();
    first.release().expect("release");

    let second = manager.acquire(ctx("a", EnginePolicy::Reuse)).expect("second");
    let second_flag: bool =
        BindingInjector::binding(second.engine(), Binding::CachedEngine).expect("flag");
    assert_eq!(second.engine().id(), first_id);
    second.release().expect("release");

    assert!(!first_flag);
    assert!(second_flag);
}

#[test]
fn different_keys_get_different_engines() {
    let manager = EngineManager::new();
    let a = manager.acquire(ctx("a", EnginePolicy::Reuse)).expect("a");
    let b = manager.acquire(ctx("b", EnginePolicy::Reuse)).expect("b");
    assert_ne!(a.engine().id(), b.engine().id());
    b.release().expect("release b");
    a.release().expect("release a");
    assert_eq!(manager.cache().len(), 2);
}

// ─── Release ────────────────────────────────────────────────────────

#[test]
fn release_clears_every_binding_and_restores_stream() {
    let manager = EngineManager::new();
    let buffer = CaptureBuffer::new();
    let context = ExecutionContext::builder(
        command("a").with_alternate_source("/ext/Sample.pushbutton/config.lua"),
    )
    .output(OutputStream::capture(&buffer))
    .host(json!({"name": "host"}))
    .document(json!({"ui": 1}), json!({"title": "Plan"}))
    .command_data(json!({"k": "v"}))
    .selected_elements(vec![json!(1)])
    .debug_mode(true)
    .alternate_mode(true)
    .build();

    // Record the stream the engine has before attach.
    let engine = manager
        .acquire(ctx("a", EnginePolicy::Reuse))
        .map(|inv| {
            let engine = Arc::clone(inv.engine());
            inv.release().expect("release warmup");
            engine
        })
        .expect("warm up");
    let before_attach = engine.output();

    let inv = manager.acquire(context).expect("acquire");
    assert!(Arc::ptr_eq(inv.engine(), &engine));
    for binding in Binding::ALL {
        if binding != Binding::AlternateCommandPath {
            assert!(
                !BindingInjector::is_absent(&engine, binding).expect("read"),
                "{} should be bound",
                binding.global_name()
            );
        }
    }
    inv.exec("print('inside')", "t").expect("exec");
    inv.release().expect("release");

    for binding in Binding::ALL {
        assert!(
            BindingInjector::is_absent(&engine, binding).expect("read"),
            "{} should be absent after release",
            binding.global_name()
        );
    }
    assert!(engine.output().same_stream(&before_attach));
    assert_eq!(buffer.contents(), "inside\n");
}

#[test]
fn aborted_script_still_releases_on_drop() {
    let manager = EngineManager::new();
    let buffer = CaptureBuffer::new();
    let context = ExecutionContext::builder(command("a"))
        .output(OutputStream::capture(&buffer))
        .build();

    let engine = {
        let inv = manager.acquire(context).expect("acquire");
        let engine = Arc::clone(inv.engine());
        let result = inv.exec("print('before') error('boom')", "t");
        assert!(result.is_err());
        engine
        // `inv` dropped here without release
    };

    assert_eq!(engine.output().label(), "stdout");
    assert!(BindingInjector::is_absent(&engine, Binding::CommandName).expect("read"));
    assert_eq!(buffer.contents(), "before\n");
}

#[test]
fn nested_invocations_on_one_engine() {
    let manager = EngineManager::new();
    let outer_buf = CaptureBuffer::new();
    let inner_buf = CaptureBuffer::new();

    let outer = manager
        .acquire(
            ExecutionContext::builder(CommandInfo::new("Outer", "/o.lua").with_extension("x"))
                .output(OutputStream::capture(&outer_buf))
                .build(),
        )
        .expect("outer");
    let inner = manager
        .acquire(
            ExecutionContext::builder(CommandInfo::new("Inner", "/i.lua").with_extension("x"))
                .output(OutputStream::capture(&inner_buf))
                .build(),
        )
        .expect("inner");
    assert!(Arc::ptr_eq(outer.engine(), inner.engine()));
    assert!(inner.is_cached());

    inner.exec("print(__commandname__)", "t").expect("inner exec");
    inner.release().expect("inner release");

    outer.exec("print(__commandname__)", "t").expect("outer exec");
    outer.release().expect("outer release");

    assert_eq!(inner_buf.contents(), "Inner\n");
    assert_eq!(outer_buf.contents(), "Outer\n");
}

#[test]
fn out_of_order_release_is_reported() {
    let manager = EngineManager::new();
    let warm = manager.acquire(ctx("x", EnginePolicy::Reuse)).expect("warm");
    let engine = Arc::clone(warm.engine());
    warm.release().expect("release");
    let original = engine.output();

    let outer_buf = CaptureBuffer::new();
    let outer = manager
        .acquire(
            ExecutionContext::builder(command("x"))
                .output(OutputStream::capture(&outer_buf))
                .build(),
        )
        .expect("outer");
    let inner = manager.acquire(ctx("x", EnginePolicy::Reuse)).expect("inner");

    let err = outer.release().unwrap_err();
    assert!(matches!(err, EngineError::StreamOutOfOrder { .. }));

    inner.release().expect("inner release still succeeds");
    assert!(engine.output().same_stream(&original));
    assert_eq!(engine.output().label(), "stdout");

    // A later invocation must not write into the released outer sink
    let later_buf = CaptureBuffer::new();
    let later = manager
        .acquire(
            ExecutionContext::builder(command("x"))
                .output(OutputStream::capture(&later_buf))
                .build(),
        )
        .expect("later");
    later.exec("print('later')", "t").expect("exec");
    later.release().expect("release");

    assert_eq!(later_buf.contents(), "later\n");
    assert!(outer_buf.is_empty());
    assert_eq!(engine.output().label(), "stdout");
}

// ─── Reset ──────────────────────────────────────────────────────────

#[test]
fn reset_all_then_get_yields_nothing() {
    let manager = EngineManager::new();
    for ext in ["a", "b", "c"] {
        manager
            .acquire(ctx(ext, EnginePolicy::Reuse))
            .expect("acquire")
            .release()
            .expect("release");
    }

    assert_eq!(manager.clear_engines(), 3);
    for ext in ["a", "b", "c"] {
        assert!(manager.cached_engine(&CacheKey::new(ext)).is_none());
    }
}

#[test]
fn shared_cache_between_managers() {
    let cache = Arc::new(EngineCache::new());
    let first = EngineManager::builder().with_cache(Arc::clone(&cache)).build();
    let second = EngineManager::builder().with_cache(Arc::clone(&cache)).build();

    let inv = first.acquire(ctx("a", EnginePolicy::Reuse)).expect("first");
    let id = inv.engine().id();
    inv.release().expect("release");

    let inv = second.acquire(ctx("a", EnginePolicy::Reuse)).expect("second");
    assert!(inv.is_cached());
    assert_eq!(inv.engine().id(), id);
    inv.release().expect("release");
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[test]
fn scenario_reuse_refresh_reuse() {
    let factory = CountingFactory::default();
    let created = Arc::clone(&factory.created);
    let manager = EngineManager::builder().with_factory(factory).build();
    let key = CacheKey::new("A");

    let inv = manager.acquire(ctx("A", EnginePolicy::Reuse)).expect("I1");
    let i1 = inv.engine().id();
    assert_eq!(manager.cached_engine(&key).expect("A").id(), i1);
    inv.release().expect("release I1");

    let inv = manager.acquire(ctx("A", EnginePolicy::Refresh)).expect("I2");
    let i2 = inv.engine().id();
    assert_ne!(i1, i2);
    assert_eq!(manager.cached_engine(&key).expect("A").id(), i2);
    inv.release().expect("release I2");

    let inv = manager.acquire(ctx("A", EnginePolicy::Reuse)).expect("reuse");
    assert_eq!(inv.engine().id(), i2);
    assert!(inv.is_cached());
    let flag: bool = BindingInjector::binding(inv.engine(), Binding::CachedEngine).expect("flag");
    assert!(flag);
    inv.release().expect("release");

    assert_eq!(created.load(Ordering::SeqCst), 2);
}

#[test]
fn scenario_documents() {
    let manager = EngineManager::new();

    let without = manager.acquire(ctx("d", EnginePolicy::Clean)).expect("no doc");
    let (zero, doc_absent, ui_absent): (bool, bool, bool) = without
        .engine()
        .eval(
            "return __zerodoc__, cinder.isnull(__activedoc__), cinder.isnull(__activeuidoc__)",
            "t",
        )
        .expect("eval");
    assert!(zero);
    assert!(doc_absent);
    assert!(ui_absent);
    without.release().expect("release");

    let with = manager
        .acquire(
            ExecutionContext::builder(command("d"))
                .policy(EnginePolicy::Clean)
                .output(OutputStream::sink())
                .document(json!({"view": "Level 1"}), json!({"title": "Tower"}))
                .build(),
        )
        .expect("doc");
    let (zero, title, view): (bool, String, String) = with
        .engine()
        .eval(
            "return __zerodoc__, __activedoc__.title, __activeuidoc__.view",
            "t",
        )
        .expect("eval");
    assert!(!zero);
    assert_eq!(title, "Tower");
    assert_eq!(view, "Level 1");
    with.release().expect("release");
}

#[test]
fn legacy_flags_follow_priority_order() {
    let manager = EngineManager::new();

    // All three set: full isolation wins, nothing cached.
    let context = ExecutionContext::builder(command("flags"))
        .policy_flags(true, true, true)
        .output(OutputStream::sink())
        .build();
    let inv = manager.acquire(context).expect("acquire");
    assert_eq!(
        inv.engine().options().frame_mode,
        cinder_engine::FrameMode::Full
    );
    inv.release().expect("release");
    assert!(manager.cache().is_empty());

    // Clean beats refresh: still nothing cached.
    let context = ExecutionContext::builder(command("flags"))
        .policy_flags(false, true, true)
        .output(OutputStream::sink())
        .build();
    manager
        .acquire(context)
        .expect("acquire")
        .release()
        .expect("release");
    assert!(manager.cache().is_empty());
}
