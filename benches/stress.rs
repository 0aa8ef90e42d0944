use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, TimeDelta, Utc};
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

/// 00:00-23:30 in 30-minute slots.
const SLOTS_PER_DAY: usize = 47;

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotd")
        .user("slotd")
        .password(std::env::var("SLOTD_PASSWORD").unwrap_or_else(|_| "slotd".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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

/// A host open every day 00:00-23:30 with one 30-minute event type.
struct Host {
    id: Ulid,
    event_type: Ulid,
}

async fn create_host(client: &Client) -> Host {
    let id = Ulid::new();
    let event_type = Ulid::new();
    let username = format!("b{}", id.to_string().to_lowercase());
    client
        .batch_execute(&format!(
            "INSERT INTO hosts (id, username) VALUES ('{id}', '{username}')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO event_types (id, host_id, slug, name, duration) \
             VALUES ('{event_type}', '{id}', 'call', 'Call', 30)"
        ))
        .await
        .unwrap();
    for day in 0..7 {
        client
            .batch_execute(&format!(
                "INSERT INTO weekly_rules (id, host_id, day_of_week, start_time, end_time) \
                 VALUES ('{}', '{id}', {day}, '00:00', '23:30')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    Host { id, event_type }
}

/// The `n`th slot counting from midnight UTC of `first_day`.
fn slot_start(first_day: NaiveDate, n: usize) -> String {
    let day = first_day + TimeDelta::days((n / SLOTS_PER_DAY) as i64);
    let minutes = (n % SLOTS_PER_DAY) as i64 * 30;
    let t = day.and_hms_opt(0, 0, 0).unwrap().and_utc() + TimeDelta::minutes(minutes);
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn claim_sql(event_type: Ulid, start: &str, i: usize) -> String {
    format!(
        "INSERT INTO bookings (event_type_id, attendee_name, attendee_email, start_time) \
         VALUES ('{event_type}', 'Bench Guest', 'guest{i}@example.com', '{start}')"
    )
}

async fn phase1_sequential(client: &Client, host: &Host, first_day: NaiveDate) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let sql = claim_sql(host.event_type, &slot_start(first_day, i), i);
        let t = Instant::now();
        client.simple_query(&sql).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} claims in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("claim latency", &mut latencies);
}

/// Every connection races for the same slots; exactly one claim per slot
/// may win.
async fn phase2_contention(host: &str, port: u16, target: &Host, first_day: NaiveDate) {
    let n_conns = 32;
    let n_slots = 200;
    let confirmed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for c in 0..n_conns {
        let host = host.to_string();
        let event_type = target.event_type;
        let confirmed = confirmed.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for i in 0..n_slots {
                let sql = claim_sql(event_type, &slot_start(first_day, i), c * n_slots + i);
                match client.simple_query(&sql).await {
                    Ok(_) => confirmed.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|s| s.code()) == Some("23P01") => {
                        conflicts.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_conns * n_slots;
    let won = confirmed.load(Ordering::Relaxed);
    println!(
        "  {total} claims over {n_conns} connections in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  confirmed={won}, conflicts={}",
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(won, n_slots, "each slot must be won exactly once");
}

async fn phase3_read_under_load(host: &str, port: u16, target: &Host, first_day: NaiveDate) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let mut writers = Vec::new();
    for w in 0..4 {
        let host = host.to_string();
        let event_type = target.event_type;
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let n = 10_000 + w * 5_000 + i;
                let _ = client
                    .simple_query(&claim_sql(event_type, &slot_start(first_day, n), n))
                    .await;
                i += 1;
            }
        }));
    }

    let reader = connect(host, port).await;
    let mut latencies = Vec::new();
    for i in 0..500 {
        let date = first_day + TimeDelta::days((i % 30) as i64);
        let sql = format!(
            "SELECT * FROM slots WHERE event_type_id = '{}' AND date = '{date}'",
            target.event_type
        );
        let t = Instant::now();
        let msgs = reader.simple_query(&sql).await.unwrap();
        latencies.push(t.elapsed());
        let rows = msgs
            .iter()
            .filter(|m| matches!(m, SimpleQueryMessage::Row(_)))
            .count();
        assert!(rows <= SLOTS_PER_DAY);
    }

    stop.store(true, Ordering::Relaxed);
    for w in writers {
        let _ = w.await;
    }
    print_latency("list slots latency under 4 writers", &mut latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 100;
    let ok = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let ok = ok.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            create_host(&client).await;
            ok.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    println!(
        "  {n_conns} connections creating hosts: {}/{n_conns} succeeded in {:.2}s",
        ok.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTD_PORT");

    println!("=== slotd stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Far enough ahead that no slot is in the past while the run lasts.
    let first_day = Utc::now().date_naive() + TimeDelta::days(7);

    println!("[setup]");
    let client = connect(&host, port).await;
    let sequential = create_host(&client).await;
    let contended = create_host(&client).await;
    let mixed = create_host(&client).await;
    println!(
        "  created hosts {}, {}, {}",
        sequential.id, contended.id, mixed.id
    );

    println!("\n[phase 1] sequential claim throughput");
    phase1_sequential(&client, &sequential, first_day).await;

    println!("\n[phase 2] claim contention");
    phase2_contention(&host, port, &contended, first_day).await;

    println!("\n[phase 3] slot listing under write load");
    phase3_read_under_load(&host, port, &mixed, first_day).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
