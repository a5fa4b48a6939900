//! shardwire end-to-end smoke test
//!
//! Exercises the full stack:
//!   Part A: buffer pool lease, recycle, slab growth
//!   Part B: cursor seek and HTTP token recognition across block edges
//!   Part C: request parsing and vectored response writes on shards
//!   Part D: staged shutdown of the shard group
//!
//! Run: SHARDWIRE_LOG=debug ./target/release/shardwire-smoke
//! Shard count comes from SHARDWIRE_SHARDS (default 2).

use std::process::ExitCode;
use std::time::{Duration, Instant};

use shardwire_buffer::{BlockChain, BufferPool, Cursor, HttpMethod, HttpVersion, PoolConfig, ScanMode};
use shardwire_core::env::{env_get, env_get_opt};
use shardwire_runtime::{ShardConfig, ShardContext, ShardGroup, ShardState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WAIT: Duration = Duration::from_secs(5);
const MAX_TARGET: usize = 2048;

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        self.total += 1;
        if ok {
            self.passed += 1;
            println!("  [{:2}] {:<52} PASS", self.total, name);
        } else {
            self.failed += 1;
            println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
        }
    }

    fn summary(&self) -> ExitCode {
        println!("\n{}", LINE);
        println!("  {} passed, {} failed, {} total", self.passed, self.failed, self.total);
        println!("{}", LINE);
        if self.failed == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

// ── Request line parsing ──

#[derive(Debug, PartialEq)]
struct RequestLine {
    method: HttpMethod,
    target: String,
    version: HttpVersion,
}

/// Parse `METHOD SP target SP VERSION CR` from the head of a chain.
fn parse_request_line(start: Cursor<'_>) -> Option<RequestLine> {
    let (method, len) = start.known_method()?;
    let mut cursor = start;
    cursor.skip(len + 1).ok()?;

    let target_start = cursor;
    cursor.seek(b' ', Some(MAX_TARGET))?;
    let mut target = vec![0u8; target_start.get_length(&cursor).ok()?];
    target_start.copy_to(&mut target);

    cursor.skip(1).ok()?;
    let version = cursor.known_version()?;
    Some(RequestLine {
        method,
        target: String::from_utf8(target).ok()?,
        version,
    })
}

/// Parse a request and write a response on the shard. Returns the
/// response bytes.
fn serve(ctx: &mut ShardContext, segments: Vec<Vec<u8>>) -> Result<Vec<u8>, String> {
    let parts: Vec<&[u8]> = segments.iter().map(Vec::as_slice).collect();
    let request = BlockChain::from_segments(ctx.pool(), &parts).map_err(|e| e.to_string())?;
    let line = parse_request_line(request.cursor()).ok_or("malformed request line")?;

    let body = format!("{} {}", line.method, line.target);
    let head = format!(
        "{} 200 OK\r\nContent-Length: {}\r\n\r\n",
        line.version,
        body.len()
    );
    let response = BlockChain::from_segments(ctx.pool(), &[head.as_bytes(), body.as_bytes()])
        .map_err(|e| e.to_string())?;

    let mut out = Vec::new();
    let mut write = ctx.write_requests().allocate().map_err(|e| e.to_string())?;
    write
        .write_chain(&mut out, &response.cursor(), &response.end_cursor())
        .map_err(|e| e.to_string())?;
    ctx.write_requests().return_request(write).map_err(|e| e.to_string())?;
    Ok(out)
}

fn split(data: &[u8], at: &[usize]) -> Vec<Vec<u8>> {
    let mut parts = Vec::with_capacity(at.len() + 1);
    let mut from = 0;
    for &to in at {
        parts.push(data[from..to].to_vec());
        from = to;
    }
    parts.push(data[from..].to_vec());
    parts
}

// ── Parts ──

fn part_a(t: &mut TestRunner) {
    t.section("Part A: buffer pool");
    let pool = match BufferPool::new(PoolConfig::new().blocks_per_slab(4)) {
        Ok(pool) => pool,
        Err(e) => {
            t.check("build pool", false, &e.to_string());
            return;
        }
    };

    let first = pool.lease();
    t.check("lease from empty pool", first.is_ok(), "lease failed");
    let blocks: Vec<_> = (0..7).filter_map(|_| pool.lease().ok()).collect();
    let stats = pool.stats();
    t.check("pool grows by whole slabs", stats.slabs == 2 && stats.carved == 8, &format!("{stats:?}"));

    for block in blocks {
        let _ = pool.return_block(block);
    }
    if let Ok(block) = first {
        let _ = pool.return_block(block);
    }
    let stats = pool.stats();
    t.check("all blocks recycled", stats.free == 8 && stats.leased == 0, &format!("{stats:?}"));

    let big = pool.lease_with(64 * 1024);
    t.check(
        "oversized lease is standalone",
        big.as_ref().map(|b| !b.is_pooled()).unwrap_or(false),
        "oversized lease failed or was pooled",
    );

    pool.dispose();
    t.check("lease after dispose fails", pool.lease().is_err(), "lease succeeded");
}

fn part_b(t: &mut TestRunner) {
    t.section("Part B: cursor and tokens");
    let pool = BufferPool::default();
    let raw = b"OPTIONS * HTTP/1.0\r\nHost: smoke\r\n\r\n";

    for at in [3usize, 7, 10, 14, 17] {
        let parts = split(raw, &[at]);
        let slices: Vec<&[u8]> = parts.iter().map(Vec::as_slice).collect();
        let parsed = BlockChain::from_segments(&pool, &slices)
            .ok()
            .and_then(|chain| parse_request_line(chain.cursor()));
        let expected = RequestLine {
            method: HttpMethod::Options,
            target: "*".into(),
            version: HttpVersion::Http10,
        };
        t.check(
            &format!("request line split at {at}"),
            parsed.as_ref() == Some(&expected),
            &format!("{parsed:?}"),
        );
    }

    let chain = match BlockChain::from_segments(&pool, &[b"abc\r", b"\ndef", b"\r\n"]) {
        Ok(chain) => chain,
        Err(e) => {
            t.check("build chain", false, &e.to_string());
            return;
        }
    };
    for mode in [ScanMode::Scalar, ScanMode::Vector] {
        let mut cursor = chain.cursor();
        let _ = cursor.skip(4);
        let found = cursor.seek_with(mode, [b'\r', b'\n'], None);
        t.check(
            &format!("{mode:?} seek crosses blocks"),
            found == Some(b'\n') && chain.cursor().get_length(&cursor).ok() == Some(4),
            &format!("{found:?}"),
        );
    }
    info!(scan = ?ScanMode::detect(), "scan mode");
}

fn part_c(t: &mut TestRunner, group: &ShardGroup) {
    t.section("Part C: shard request handling");
    let requests = env_get("SHARDWIRE_SMOKE_REQUESTS", 256usize);
    let raw = b"GET /index.html HTTP/1.1\r\nHost: smoke\r\n\r\n";

    let started = Instant::now();
    let pending: Vec<_> = (0..requests)
        .map(|i| {
            let at = 1 + i % (raw.len() - 1);
            let segments = split(raw, &[at]);
            group.next().post_async(move |ctx| serve(ctx, segments))
        })
        .collect();

    let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 15\r\n\r\nGET /index.html".to_vec();
    let mut ok = 0;
    let mut first_error = None;
    for completion in pending {
        match completion.wait_timeout(WAIT) {
            Ok(Ok(body)) if body == expected => ok += 1,
            Ok(Ok(body)) => {
                first_error.get_or_insert(String::from_utf8_lossy(&body).into_owned());
            }
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(e.to_string());
            }
        }
    }
    info!(requests, elapsed = ?started.elapsed(), "requests served");
    t.check(
        &format!("{requests} requests served"),
        ok == requests,
        first_error.as_deref().unwrap_or(""),
    );

    let failed = group.next().post_async(|_| -> usize { panic!("smoke handler panic") });
    t.check("panic faults only its handle", failed.wait_timeout(WAIT).is_err(), "panic not reported");
    let alive = group
        .shards()
        .iter()
        .all(|s| s.post_async(|ctx| ctx.shard_id()).wait_timeout(WAIT).is_ok());
    t.check("shards alive after panic", alive, "a shard stopped");

    let leased: usize = group
        .shards()
        .iter()
        .filter_map(|s| s.post_async(|ctx| ctx.pool().stats().leased).wait_timeout(WAIT).ok())
        .sum();
    t.check("no blocks leaked", leased == 0, &format!("{leased} blocks still leased"));
}

fn part_d(t: &mut TestRunner, group: ShardGroup, config: &ShardConfig) {
    t.section("Part D: shutdown");
    let started = Instant::now();
    let result = group.stop(config.shutdown_timeout);
    t.check(
        "group stops cleanly",
        result.is_ok(),
        &result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
    );
    t.check(
        "all shards stopped",
        group.shards().iter().all(|s| s.state() == ShardState::Stopped),
        "shard still running",
    );
    info!(elapsed = ?started.elapsed(), "group stopped");
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SHARDWIRE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ShardConfig::from_env();
    config.print();
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::from(2);
    }
    let shards = env_get_opt::<usize>("SHARDWIRE_SHARDS").unwrap_or(2);

    let mut t = TestRunner::new();
    part_a(&mut t);
    part_b(&mut t);

    match ShardGroup::start(&config, shards) {
        Ok(group) => {
            part_c(&mut t, &group);
            part_d(&mut t, group, &config);
        }
        Err(e) => {
            warn!(error = %e, "shard group failed to start");
            t.check("start shard group", false, &e.to_string());
        }
    }

    t.summary()
}
