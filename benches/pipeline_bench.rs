//! 计费流水线性能基准测试
//!
//! 测试覆盖：
//! - 规则集编译性能
//! - 不同数据量下的规则执行性能
//! - 单步执行性能
//! - 四步完整流水线性能

use billing_shared::test_utils::TestDataGenerator;
use chrono::NaiveDate;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rule_engine::diagnostics::LogOnlySink;
use rule_engine::{
    BillingPipeline, FixedClock, RuleEngine, RuleSet, RuleSetCompiler, RuleSetStore, Stage,
    StageContext, Table, VariableTable, run_stage,
};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;

const TABLE_SIZES: [usize; 4] = [10, 100, 500, 2000];

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 5, 20).unwrap()
}

fn create_table(rows: usize) -> Table {
    Table::from_json_value(&TestDataGenerator::member_table(rows, 1, "JAN", 2025)).unwrap()
}

fn financial_rules() -> RuleSet {
    serde_json::from_value(TestDataGenerator::financial_rule_set()).unwrap()
}

fn single_rule_set(step: u8) -> RuleSet {
    serde_json::from_value(json!({
        "metadata": { "name": format!("step {}", step), "step": step },
        "rules": [
            {
                "id": "interest",
                "type": "batch_update",
                "operations": [
                    { "field": "INTEREST", "value": "INT(ARREARS*${INTEREST_RATE}/1200)" }
                ]
            }
        ],
        "variables": { "INTEREST_RATE": 21 }
    }))
    .unwrap()
}

/// 规则集编译基准
fn bench_compilation(c: &mut Criterion) {
    let mut group = c.benchmark_group("compilation");

    let json = TestDataGenerator::financial_rule_set().to_string();
    let base = VariableTable::new();

    group.bench_function("financial_rule_set", |b| {
        let compiler = RuleSetCompiler::new();
        b.iter(|| compiler.compile_from_json(black_box(&json), &base).unwrap())
    });

    group.finish();
}

/// 规则执行基准：不同数据量
fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_execute");

    let compiled = RuleSetCompiler::new()
        .compile(&financial_rules(), &VariableTable::new())
        .unwrap();
    let engine = RuleEngine::new();

    for rows in TABLE_SIZES {
        let table = create_table(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &table, |b, table| {
            b.iter(|| engine.execute(black_box(table), &compiled, &LogOnlySink).unwrap())
        });
    }

    group.finish();
}

/// 第 2 步单步执行基准（含预处理、后处理和校验）
fn bench_financial_stage(c: &mut Criterion) {
    let mut group = c.benchmark_group("financial_stage");

    let rules = financial_rules();
    let ctx = StageContext::new(today());

    for rows in TABLE_SIZES {
        let table = create_table(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &table, |b, table| {
            b.iter(|| {
                run_stage(
                    Stage::FinancialCalculation,
                    black_box(table),
                    Some(&rules),
                    &ctx,
                )
                .unwrap()
            })
        });
    }

    group.finish();
}

/// 四步完整流水线基准
fn bench_full_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_pipeline");
    group.sample_size(20);

    let store = Arc::new(RuleSetStore::new());
    store.load(Stage::Initialize, single_rule_set(1)).unwrap();
    store.load(Stage::FinancialCalculation, financial_rules()).unwrap();
    store.load(Stage::BillGeneration, single_rule_set(3)).unwrap();

    for rows in [100, 1000] {
        let table = create_table(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &table, |b, table| {
            b.iter(|| {
                let mut pipeline = BillingPipeline::new()
                    .with_clock(FixedClock(today()))
                    .with_rule_store(Arc::clone(&store));
                pipeline.load_table(table.clone());
                for stage in Stage::ALL {
                    pipeline.run_with_store(stage).unwrap();
                }
                black_box(pipeline.output(Stage::Finalize).map(Table::len))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_compilation,
    bench_engine,
    bench_financial_stage,
    bench_full_pipeline
);
criterion_main!(benches);
