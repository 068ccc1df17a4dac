use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use trellis::*;

struct Config;
impl Injectable for Config {
    fn construct(_: &mut Deps) -> Result<Self> {
        Ok(Config)
    }
}

struct Service;
impl Injectable for Service {
    fn dependencies() -> Vec<Token> {
        vec![Token::of::<Config>()]
    }

    fn construct(deps: &mut Deps) -> Result<Self> {
        deps.next::<Config>()?;
        Ok(Service)
    }
}

struct Handler;
impl Injectable for Handler {
    fn dependencies() -> Vec<Token> {
        vec![Token::of::<Service>(), Token::from(&*PATH_PARAMS)]
    }

    fn construct(deps: &mut Deps) -> Result<Self> {
        deps.next::<Service>()?;
        deps.next_instance()?;
        Ok(Handler)
    }
}

macro_rules! leaf_module {
    ($name:ident, $token:expr) => {
        struct $name;
        impl Module for $name {
            fn declare() -> ModuleDecl {
                ModuleDecl::feature()
                    .providers_per_mod([Provider::value($token, 1u32)])
                    .export($token)
            }
        }
    };
}

leaf_module!(LeafA, "a");
leaf_module!(LeafB, "b");
leaf_module!(LeafC, "c");
leaf_module!(LeafD, "d");

struct ServiceModule;
impl Module for ServiceModule {
    fn declare() -> ModuleDecl {
        ModuleDecl::feature()
            .import::<LeafA>()
            .import::<LeafB>()
            .providers_per_mod([Provider::of::<Config>(), Provider::of::<Service>()])
            .providers_per_req([Provider::of::<Handler>()])
            .export(Token::of::<Service>())
            .controller(ControllerDef::new("ServiceController"))
    }
}

struct BenchApp;
impl Module for BenchApp {
    fn declare() -> ModuleDecl {
        ModuleDecl::root()
            .import::<LeafC>()
            .import::<LeafD>()
            .import_with_params(ServiceModule::with_params().id("service").prefix("service"))
    }
}

fn bench_scan(c: &mut Criterion) {
    c.bench_function("scan_root_module", |b| {
        b.iter(|| {
            let mut manager = ModuleManager::new();
            manager.scan_root_module(black_box(ModuleRef::of::<BenchApp>())).unwrap();
            manager.len()
        })
    });
}

fn bench_bootstrap(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("application_bootstrap", |b| {
        b.to_async(&rt).iter(|| async {
            Application::builder(ModuleRef::of::<BenchApp>())
                .bootstrap()
                .await
                .unwrap()
        })
    });
}

fn bench_injector(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let app = rt
        .block_on(Application::builder(ModuleRef::of::<BenchApp>()).bootstrap())
        .unwrap();
    let route = app.route_injector("service").unwrap();

    let mut group = c.benchmark_group("injector");

    group.bench_function("cached_module_lookup", |b| {
        let injector = app.injector_for("service").unwrap();
        b.iter(|| injector.get(black_box(Token::of::<Service>())).unwrap())
    });

    group.bench_function("request_scope", |b| {
        b.iter(|| {
            let request = route.request(RequestContext::new().path_param("id", "42"));
            request.get(Token::of::<Handler>()).unwrap()
        })
    });

    group.finish();
}

criterion_group!(resolution_benches, bench_scan, bench_bootstrap, bench_injector);

criterion_main!(resolution_benches);
