use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use labgate::engine::{ActComponentRequest, ActRequest, BookingSpec, ComponentRequestSpec, Engine, EngineError, ItemSpec};
use labgate::model::*;
use labgate::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn staff() -> Actor {
    Actor::new("staff@campus.edu", Role::LabStaff)
}

fn hod() -> Actor {
    Actor::new("hod@campus.edu", Role::Hod)
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + Days::new(offset)
}

fn fresh_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("labgate_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(Engine::new(dir.join(name), Arc::new(NotifyHub::new())).unwrap())
}

async fn setup_labs(engine: &Engine, n: usize) -> Vec<Ulid> {
    let dept = Ulid::new();
    engine
        .register_department(dept, "Bench".into(), ApprovalAuthority::Hod)
        .await
        .unwrap();
    let mut labs = Vec::with_capacity(n);
    for i in 0..n {
        let id = Ulid::new();
        engine
            .register_lab(LabInfo {
                id,
                department_id: dept,
                name: format!("Lab {i}"),
                location: None,
                capacity: 60,
                opening: None,
                responsible: None,
            })
            .await
            .unwrap();
        labs.push(id);
    }
    println!("  created {} labs", labs.len());
    labs
}

fn spec(lab_ids: Vec<Ulid>, date: NaiveDate, span: Span) -> BookingSpec {
    BookingSpec {
        id: Ulid::new(),
        requester: Actor::new("faculty@campus.edu", Role::Faculty),
        supervisor: None,
        lab_ids,
        date,
        span,
        purpose: "bench".into(),
        participants: None,
    }
}

/// Submit and walk a faculty booking up to the final approval.
async fn pending_final(engine: &Engine, lab_ids: Vec<Ulid>, date: NaiveDate, span: Span) -> Ulid {
    let receipt = engine.create_booking(spec(lab_ids, date, span)).await.unwrap();
    engine.act(ActRequest::approve(receipt.id, staff())).await.unwrap();
    receipt.id
}

async fn phase1_sequential(engine: &Engine, lab: Ulid) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let date = day((i / 8) as u64);
        let slot = (i % 8) as Minute;
        let span = Span::new(480 + slot * 60, 540 + slot * 60);
        let t = Instant::now();
        let id = pending_final(engine, vec![lab], date, span).await;
        engine.act(ActRequest::approve(id, hod())).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings approved in {:.2}s = {ops:.0} chains/sec", elapsed.as_secs_f64());
    print_latency("submit-to-approved latency", &mut latencies);
}

async fn phase2_final_approval_race(engine: Arc<Engine>, labs: &[Ulid]) {
    let rounds = 50;
    let contenders = 16;
    let mut latencies = Vec::with_capacity(rounds * contenders);
    let mut bad_rounds = 0;
    let start = Instant::now();

    for round in 0..rounds {
        let date = day(1000 + round as u64);
        // Single-lab contenders mixed with two-lab ones in both lab orders.
        let mut ids = Vec::with_capacity(contenders);
        for c in 0..contenders {
            let lab_ids = match c % 3 {
                0 => vec![labs[0]],
                1 => vec![labs[0], labs[1]],
                _ => vec![labs[1], labs[0]],
            };
            ids.push(pending_final(&engine, lab_ids, date, Span::new(600, 660)).await);
        }

        let mut handles = Vec::with_capacity(contenders);
        for id in ids {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let result = engine.act(ActRequest::approve(id, hod())).await;
                (result, t.elapsed())
            }));
        }

        let mut winners = 0;
        for h in handles {
            let (result, elapsed) = h.await.unwrap();
            latencies.push(elapsed);
            match result {
                Ok(_) => winners += 1,
                Err(EngineError::SlotNoLongerAvailable { .. }) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        // Every contender needs lab 0, so exactly one may hold it.
        if winners != 1 {
            bad_rounds += 1;
        }
    }

    let elapsed = start.elapsed();
    println!(
        "  {rounds} rounds x {contenders} contenders in {:.2}s, rounds with != 1 winner: {bad_rounds}",
        elapsed.as_secs_f64()
    );
    print_latency("final approval latency", &mut latencies);
}

async fn phase3_read_under_load(engine: Arc<Engine>, labs: &[Ulid]) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        let lab = labs[2 + w % (labs.len() - 2)];
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let date = day(5000 + w as u64 * 10_000 + i / 8);
                let slot = (i % 8) as Minute;
                let span = Span::new(480 + slot * 60, 540 + slot * 60);
                if let Ok(receipt) = engine.create_booking(spec(vec![lab], date, span)).await {
                    let _ = engine.act(ActRequest::approve(receipt.id, staff())).await;
                    let _ = engine.act(ActRequest::approve(receipt.id, hod())).await;
                }
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let engine = engine.clone();
        let query: Vec<Ulid> = vec![labs[2 + r % (labs.len() - 2)], labs[2 + (r + 1) % (labs.len() - 2)]];
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                engine
                    .query_free_slots(&query, day(5000 + (i % 30) as u64))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("common free slots query", &mut all_latencies);
}

async fn phase4_issue_storm(engine: Arc<Engine>, lab: Ulid) {
    let stock = 20;
    let n_requests = 50;
    let component = Ulid::new();
    engine
        .register_component(Component {
            id: component,
            lab_id: lab,
            name: "Multimeter".into(),
            quantity_total: stock,
            quantity_available: stock,
        })
        .await
        .unwrap();

    let mut ids = Vec::with_capacity(n_requests);
    for _ in 0..n_requests {
        let receipt = engine
            .create_component_request(ComponentRequestSpec {
                id: Ulid::new(),
                requester: Actor::new("faculty@campus.edu", Role::Faculty),
                supervisor: None,
                lab_id: lab,
                items: vec![ItemSpec {
                    component_id: component,
                    quantity: 1,
                }],
                purpose: "bench".into(),
                due_on: None,
            })
            .await
            .unwrap();
        engine
            .act_component(ActComponentRequest::approve(receipt.id, staff()))
            .await
            .unwrap();
        engine
            .act_component(ActComponentRequest::approve(receipt.id, hod()))
            .await
            .unwrap();
        ids.push(receipt.id);
    }

    let issued = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::with_capacity(n_requests);
    for id in ids {
        let engine = engine.clone();
        let issued = issued.clone();
        handles.push(tokio::spawn(async move {
            if engine.issue(id, staff(), None).await.is_ok() {
                issued.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = issued.load(Ordering::Relaxed);
    let left = engine.get_component(component).await.unwrap().quantity_available;
    println!(
        "  {n_requests} approved loans racing for {stock} units: {ok} issued, {left} left in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    println!("=== labgate stress benchmark ===\n");

    println!("[setup]");
    let engine = fresh_engine("stress.wal");
    let labs = setup_labs(&engine, 6).await;

    println!("\n[phase 1] sequential approval chains");
    phase1_sequential(&engine, labs[5]).await;

    println!("\n[phase 2] racing final approvals");
    phase2_final_approval_race(engine.clone(), &labs).await;

    println!("\n[phase 3] free slot queries under write load");
    phase3_read_under_load(engine.clone(), &labs).await;

    println!("\n[phase 4] component issue storm");
    phase4_issue_storm(engine.clone(), labs[0]).await;

    println!("\n=== benchmark complete ===");
}
