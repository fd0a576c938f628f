use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config.host(host).port(port).dbname("allocd").user("allocd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Run an INSERT and return the `id` column of the row it creates.
async fn insert(client: &Client, sql: &str) -> Result<String, tokio_postgres::Error> {
    let messages = client.simple_query(sql).await?;
    let id = messages
        .iter()
        .find_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => row.get("id").map(str::to_string),
            _ => None,
        })
        .expect("INSERT returned no row");
    Ok(id)
}

async fn create_resource(client: &Client, name: &str) -> String {
    insert(client, &format!("INSERT INTO resources VALUES ('{name}', 'room')"))
        .await
        .unwrap()
}

/// Event covering `days` days starting `offset` days after 2024-01-01.
async fn create_event(client: &Client, title: &str, offset: u64, days: u64) -> String {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let start = base + Days::new(offset);
    let end = start + Days::new(days.saturating_sub(1));
    insert(
        client,
        &format!(
            "INSERT INTO events VALUES ('{title}', '', '{}', '{}')",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        ),
    )
    .await
    .unwrap()
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let room = create_resource(&client, "seq-room").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        // One event per day, so no allocation conflicts.
        let event = create_event(&client, &format!("seq-{i}"), i as u64, 1).await;
        let t = Instant::now();
        client
            .batch_execute(&format!("INSERT INTO allocations VALUES ('{event}', '{room}')"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} events + allocations in {:.2}s = {ops:.0} pairs/sec", elapsed.as_secs_f64());
    print_latency("allocation latency", &mut latencies);
}

async fn phase2_contended(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 100;
    let n_rooms = 3;

    let setup = connect(host, port).await;
    let mut rooms = Vec::new();
    for i in 0..n_rooms {
        rooms.push(create_resource(&setup, &format!("hot-room-{i}")).await);
    }
    let rooms = Arc::new(rooms);

    let committed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let rooms = rooms.clone();
        let committed = committed.clone();
        let conflicts = conflicts.clone();

        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for j in 0..n_per_task {
                // Every task walks the same 60 days, so most attempts collide.
                let event = create_event(&client, &format!("hot-{t}-{j}"), (j % 60) as u64, 2).await;
                let room = &rooms[j % rooms.len()];
                match client
                    .batch_execute(&format!("INSERT INTO allocations VALUES ('{event}', '{room}')"))
                    .await
                {
                    Ok(()) => committed.fetch_add(1, Ordering::Relaxed),
                    Err(_) => conflicts.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} attempts = {total} in {:.2}s: {} committed, {} conflicts",
        elapsed.as_secs_f64(),
        committed.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
    );
}

async fn phase3_report_under_load(host: &str, port: u16) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let room = create_resource(&client, &format!("writer-room-{w}")).await;
            let mut i = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let event = create_event(&client, &format!("w{w}-{i}"), i, 1).await;
                let _ = client
                    .batch_execute(&format!("INSERT INTO allocations VALUES ('{event}', '{room}')"))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(
                        "SELECT * FROM utilization WHERE start_date = '2024-01-01' AND end_date = '2024-12-31'",
                    )
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

    print_latency("utilization report", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let room = create_resource(&client, &format!("storm-room-{c}")).await;
            for i in 0..ops_per_conn {
                let event = create_event(&client, &format!("storm-{c}-{i}"), i, 1).await;
                client
                    .batch_execute(&format!("INSERT INTO allocations VALUES ('{event}', '{room}')"))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ALLOCD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ALLOCD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid ALLOCD_PORT");

    println!("=== allocd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential allocation throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended concurrent allocations");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] report latency under write load");
    phase3_report_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
