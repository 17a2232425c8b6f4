use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use spec_concretizer::{
    ConcretizeOptions, Concretizer, InMemoryRepository, PackageDef, Policy, RepoSnapshot,
    parse_spec,
};

const SPECS: &[&str] = &[
    "zlib",
    "hdf5@1.14:+mpi~shared",
    "hdf5@1.14.3+mpi api=v110 target=zen3 %gcc@13 ^openmpi@5 fabrics=ucx ^zlib@1.3",
    "app %c,cxx=clang@17 %fortran=gcc",
];

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for spec in SPECS {
        group.bench_with_input(BenchmarkId::from_parameter(spec), spec, |b, spec| {
            b.iter(|| parse_spec(black_box(spec)).unwrap());
        });
    }
    group.finish();
}

/// A layered stack: `width` libraries per layer, each depending on every
/// library of the layer below and on a compiler.
fn stack(layers: usize, width: usize) -> InMemoryRepository {
    let mut repo = InMemoryRepository::new();
    for name in ["gcc", "clang"] {
        let mut compiler = PackageDef::builder(name).version("14.1").version("13.2");
        compiler = compiler.provides("c").provides("cxx");
        if name == "gcc" {
            compiler = compiler.provides("fortran");
        }
        repo.add(compiler.build().unwrap());
    }
    for layer in 0..layers {
        for i in 0..width {
            let mut lib = PackageDef::builder(format!("lib{layer}-{i}"))
                .version("3.0")
                .version("2.1")
                .version("2.0")
                .bool_variant("shared", true)
                .bool_variant("debug", false)
                .depends_on("c");
            if layer > 0 {
                for j in 0..width {
                    lib = lib.depends_on(&format!("lib{}-{j}@2:", layer - 1));
                }
            }
            repo.add(lib.build().unwrap());
        }
    }
    repo
}

fn bench_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("concretize");
    group.sample_size(20);
    for (layers, width) in [(2, 2), (3, 3), (4, 3)] {
        let concretizer = Concretizer::new(
            RepoSnapshot::new(stack(layers, width)),
            Policy::from_yaml_str("packages:\n  all:\n    variants: \"~shared\"\n").unwrap(),
        );
        let request = format!("lib{}-0", layers - 1);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{layers}x{width}")),
            &request,
            |b, request| {
                b.iter(|| {
                    concretizer
                        .concretize_str(black_box(request), &ConcretizeOptions::default())
                        .unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_solve);
criterion_main!(benches);
