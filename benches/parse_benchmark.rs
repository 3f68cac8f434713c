use apfs::{BlockDevice, Container, FileEntry, ReaderDevice, Volume};
use criterion::{criterion_group, criterion_main, Criterion};
use std::io::BufReader;

fn open_appfs() -> Option<BufReader<std::fs::File>> {
    let path = std::path::Path::new("../tests/appfs.raw");
    if !path.exists() {
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    Some(BufReader::new(file))
}

fn open_container() -> Option<Container<ReaderDevice<BufReader<std::fs::File>>>> {
    let reader = open_appfs()?;
    Container::open_reader(reader).ok()
}

/// Depth-first collection of every path below `entry`, mirroring the
/// recursive walk the old single-volume facade did internally.
fn walk_all<'v, 'c, D: BlockDevice>(entry: &FileEntry<'v, 'c, D>, prefix: &str, out: &mut Vec<String>) {
    for child in entry.children().unwrap() {
        let path = format!("{prefix}/{}", child.name());
        if child.is_directory() {
            walk_all(&child, &path, out);
        } else {
            out.push(path);
        }
    }
}

fn bench_open(c: &mut Criterion) {
    if open_container().is_none() {
        eprintln!("Skipping benchmarks - appfs.raw not found");
        return;
    }

    c.bench_function("apfs_open", |b| {
        b.iter(|| {
            let container = open_container().unwrap();
            let _volume = container.volume(1).unwrap();
        })
    });
}

fn bench_list_root(c: &mut Criterion) {
    let container = match open_container() {
        Some(c) => c,
        None => return,
    };
    let volume = container.volume(1).unwrap();
    let root = volume.root().unwrap();

    c.bench_function("apfs_list_root", |b| {
        b.iter(|| {
            let _entries = root.children().unwrap();
        })
    });
}

fn bench_walk_all(c: &mut Criterion) {
    if open_container().is_none() {
        return;
    }

    c.bench_function("apfs_walk_all", |b| {
        b.iter(|| {
            let container = open_container().unwrap();
            let volume = container.volume(1).unwrap();
            let root = volume.root().unwrap();
            let mut paths = Vec::new();
            walk_all(&root, "", &mut paths);
        })
    });
}

fn bench_attributes(c: &mut Criterion) {
    let container = match open_container() {
        Some(c) => c,
        None => return,
    };
    let volume = container.volume(1).unwrap();
    let root = volume.root().unwrap();

    let mut paths = Vec::new();
    walk_all(&root, "", &mut paths);
    let file_path = paths.first().cloned();

    if let Some(path) = file_path {
        let entry = volume.lookup(&path).unwrap();
        c.bench_function("apfs_attributes", |b| {
            b.iter(|| {
                let _attrs = entry.attributes().unwrap();
            })
        });
    }
}

fn bench_read_small_file(c: &mut Criterion) {
    let container = match open_container() {
        Some(c) => c,
        None => return,
    };
    let volume = container.volume(1).unwrap();
    let root = volume.root().unwrap();

    let mut paths = Vec::new();
    walk_all(&root, "", &mut paths);

    let file_path = paths.into_iter().find(|path| {
        volume
            .lookup(path)
            .map(|e| e.size() > 0 && e.size() < 100_000)
            .unwrap_or(false)
    });

    if let Some(path) = file_path {
        let entry = volume.lookup(&path).unwrap();
        let mut buf = vec![0u8; entry.size() as usize];
        c.bench_function("apfs_read_small_file", |b| {
            b.iter(|| {
                let _n = entry.read(0, &mut buf).unwrap();
            })
        });
    }
}

fn bench_stat(c: &mut Criterion) {
    let container = match open_container() {
        Some(c) => c,
        None => return,
    };
    let volume: Volume<'_, _> = container.volume(1).unwrap();
    let root = volume.root().unwrap();

    let mut paths = Vec::new();
    walk_all(&root, "", &mut paths);
    let file_path = paths.first().cloned();

    if let Some(path) = file_path {
        c.bench_function("apfs_stat", |b| {
            b.iter(|| {
                let _entry = volume.lookup(&path).unwrap();
            })
        });
    }
}

criterion_group!(benches, bench_open, bench_list_root, bench_walk_all, bench_stat, bench_attributes, bench_read_small_file);
criterion_main!(benches);
