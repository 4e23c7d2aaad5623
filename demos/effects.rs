//! Demonstration of the effect executors, SWR fetching and the scheduler

use cannery::effect::{
    run, Callbacks, CancellableEffect, CancellableOptions, Handlers, RetryEffect, RetryOptions,
    RetryStrategy,
};
use cannery::scheduler::{EffectScheduler, Priority, ScheduledEffect, SchedulerOptions};
use cannery::swr::{RevalidateSignals, SwrCache, SwrEffect, SwrOptions};
use cannery::EffectError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() {
    println!("=== Effects Example ===\n");

    println!("1. Fire-and-forget");
    run(
        async { Ok::<_, String>(21 * 2) },
        Callbacks::new().on_success(|answer: i32| println!("   [run] answer is {answer}")),
    );
    sleep(Duration::from_millis(10)).await;

    println!("\n2. A cancellable effect with a timeout");
    let slow = CancellableEffect::new(
        || async {
            sleep(Duration::from_millis(500)).await;
            Ok::<_, String>("finished")
        },
        CancellableOptions::default().with_timeout(Duration::from_millis(100)),
        Handlers::new().on_error(|e: &EffectError<String>| println!("   [cancellable] {e}")),
    );
    slow.run();
    sleep(Duration::from_millis(200)).await;

    println!("\n3. Cancelling before it settles");
    slow.run();
    slow.cancel();
    println!("   running: {}, status: {:?}", slow.is_running(), slow.status().phase);

    println!("\n4. Retrying with exponential backoff");
    let attempts = Arc::new(AtomicU32::new(0));
    let flaky = RetryEffect::new(
        {
            let attempts = attempts.clone();
            move || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            }
        },
        RetryOptions::default()
            .with_base_delay(Duration::from_millis(20))
            .with_strategy(RetryStrategy::Exponential),
        Handlers::new().on_success(|attempt: &u32| {
            println!("   [retry] succeeded on attempt {attempt}");
        }),
    );
    flaky.run();
    sleep(Duration::from_millis(200)).await;
    println!("   retries used: {}", flaky.retry_count());

    println!("\n5. Stale-while-revalidate");
    let cache = SwrCache::new();
    let signals = RevalidateSignals::new();
    let fetches = Arc::new(AtomicU32::new(0));
    let profile = SwrEffect::builder("profile", {
        let fetches = fetches.clone();
        move || {
            let n = fetches.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                sleep(Duration::from_millis(20)).await;
                Ok::<_, String>(format!("profile v{n}"))
            }
        }
    })
    .options(SwrOptions::default().with_deduping_interval(Duration::ZERO))
    .cache(cache.clone())
    .signals(signals.clone())
    .build();

    let _watch = profile.subscribe(|state| {
        if let Some(data) = &state.effect.data {
            println!("   [swr] showing {data} (validating: {})", state.is_validating);
        }
    });
    println!("   first read: {:?}", profile.fetch());
    sleep(Duration::from_millis(50)).await;
    println!("   second read: {:?}", profile.fetch());
    sleep(Duration::from_millis(50)).await;

    println!("   window regained focus");
    signals.focus();
    sleep(Duration::from_millis(50)).await;
    println!("   fetcher called {} times", fetches.load(Ordering::SeqCst));

    println!("\n6. Scheduling effects with dependencies");
    let scheduler = EffectScheduler::new(
        SchedulerOptions::default()
            .with_concurrency(2)
            .on_complete(|| println!("   [scheduler] queue drained")),
    );
    let step = |id: &'static str, ms: u64| {
        ScheduledEffect::new(id, move || async move {
            sleep(Duration::from_millis(ms)).await;
            println!("   [scheduler] {id} done");
            Ok::<_, String>(())
        })
    };
    scheduler.add_effect(step("config", 30)).ok();
    scheduler.add_effect(step("session", 20).depends_on("config")).ok();
    scheduler
        .add_effect(
            step("dashboard", 10)
                .with_dependencies(["config", "session"])
                .with_priority(Priority::high()),
        )
        .ok();
    scheduler.add_effect(step("telemetry", 5).with_priority(Priority::low())).ok();
    scheduler.start();
    sleep(Duration::from_millis(200)).await;

    for resource in scheduler.resources() {
        println!("   {} -> {:?}", resource.id, resource.status);
    }

    println!("\n✓ Effects example complete!");
}
