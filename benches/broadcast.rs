//! Broadcast-path benchmarks for the Vantown server.
//!
//! Covers the per-tick hot paths: collision bitset encode/decode, AOI bucket
//! churn as players move between cells, and JSON encoding of roster
//! snapshots at various zone populations.
//!
//! Run with: cargo bench --bench broadcast

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

use vantown_server::data::RegionData;
use vantown_server::net::aoi::AoiGrid;
use vantown_server::net::protocol::{
    encode_server, Ack, Facing, PlayerSnapshot, ServerMsg, PROTOCOL_VERSION,
};
use vantown_server::zones::collision::{
    decode_bitset_rle, encode_bitset_rle, generate_region_grid, BuildDiagnostics, CollisionGrid,
    TERRAIN_LAND, TERRAIN_OCEAN,
};

const GRID_W: i32 = 200;
const GRID_H: i32 = 120;

/// Derive a collision grid from synthetic terrain with the given water share.
fn region_grid(w: i32, h: i32, water: f64) -> CollisionGrid {
    let mut rng = rand::thread_rng();
    let terrain: Vec<Vec<Option<i64>>> = (0..h)
        .map(|_| {
            (0..w)
                .map(|_| {
                    Some(if rng.gen_bool(water) {
                        TERRAIN_OCEAN
                    } else {
                        TERRAIN_LAND
                    })
                })
                .collect()
        })
        .collect();
    let region = RegionData {
        terrain_grid: Some(terrain),
        ..Default::default()
    };
    generate_region_grid("world:na", w, h, Some(&region), &BuildDiagnostics::default())
}

/// Benchmark collision descriptor encode/decode at several blocked densities
fn bench_collision_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("collision_codec");
    group.sample_size(50);

    for water in [0.05, 0.25, 0.50] {
        let grid = region_grid(GRID_W, GRID_H, water);
        let encoded = encode_bitset_rle(&grid);
        let label = format!("{}pct", (water * 100.0) as u32);

        group.throughput(Throughput::Elements((GRID_W * GRID_H) as u64));
        group.bench_with_input(BenchmarkId::new("encode", &label), &grid, |b, g| {
            b.iter(|| black_box(encode_bitset_rle(g)))
        });
        group.bench_with_input(BenchmarkId::new("decode", &label), &encoded, |b, e| {
            b.iter(|| black_box(decode_bitset_rle(e, GRID_W, GRID_H)))
        });
    }
    group.finish();
}

/// Benchmark AOI insert + move + visibility query at various populations
fn bench_aoi_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("aoi");
    group.sample_size(50);

    for count in [50, 250, 1000] {
        let mut rng = rand::thread_rng();
        let spots: Vec<(String, i32, i32)> = (0..count)
            .map(|i| {
                (
                    format!("e{}", i),
                    rng.gen_range(0..GRID_W),
                    rng.gen_range(0..GRID_H),
                )
            })
            .collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("move_and_query", count),
            &spots,
            |b, spots| {
                b.iter(|| {
                    let mut grid = AoiGrid::new(16);
                    for (id, x, y) in spots {
                        grid.add_player(id, *x, *y);
                    }
                    for (id, x, y) in spots {
                        grid.move_player(id, (x + 1) % GRID_W, *y);
                    }
                    black_box(grid.visible_players(&spots[0].0))
                })
            },
        );
    }
    group.finish();
}

/// Benchmark JSON encoding of a full roster snapshot
fn bench_snapshot_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire");
    group.sample_size(50);

    for count in [10, 100, 500] {
        let mut rng = rand::thread_rng();
        let players: Vec<PlayerSnapshot> = (0..count)
            .map(|i| PlayerSnapshot {
                id: format!("e_{:04}", i),
                x: rng.gen_range(0..GRID_W),
                y: rng.gen_range(0..GRID_H),
                facing: Facing::S,
                sprite_ref: "base:van".to_string(),
                dn: Some(format!("Player{}", i)),
            })
            .collect();
        let msg = ServerMsg::Snapshot {
            v: PROTOCOL_VERSION,
            zone: "world:na".to_string(),
            tick: 42,
            ack: Ack { seq: 7 },
            players,
            bounds: None,
            collision: None,
        };

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("snapshot_json", count), &msg, |b, m| {
            b.iter(|| black_box(encode_server(m).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_collision_codec,
    bench_aoi_churn,
    bench_snapshot_encode,
);

criterion_main!(benches);
