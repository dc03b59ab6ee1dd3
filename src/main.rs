use oxid_flow::{
    config::ExecConfig,
    error::ExecError,
    execution::{
        builtin::{register_builtins, CountSpec, PassSpec, ValuesSpec, ValuesTable},
        executor::Executor,
        group_key::GroupKey,
        plan::{PhysicalPlan, PlanNode, YieldSpec},
        registry::Registry,
        signal::CancellationToken,
    },
    types::Value,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn demo_plan() -> Result<PhysicalPlan, ExecError> {
    let key = |host: &str, stop: i64| GroupKey::from_pairs(vec![
        ("_start", Value::Time(stop - 60)),
        ("_stop", Value::Time(stop)),
        ("host", Value::String(host.to_string())),
    ]);
    let values = ValuesSpec {
        tables: vec![
            ValuesTable::ints(key("a", 60), "_value", vec![1, 2, 3]),
            ValuesTable::ints(key("b", 60), "_value", vec![4]),
            ValuesTable::ints(key("a", 120), "_value", vec![5, 6]),
            ValuesTable::ints(key("b", 120), "_value", vec![7, 8, 9]),
        ],
        watermark: Some(60),
    };

    let mut plan = PhysicalPlan::new();
    let values = plan.add_node(PlanNode::new("values", values).with_parallel_run(2))?;
    let pass = plan.add_node(PlanNode::new("pass", PassSpec).with_parallel_run(2))?;
    let count = plan.add_node(PlanNode::new("count", CountSpec).with_parallel_merge(2))?;
    let counts = plan.add_node(PlanNode::new("yield", YieldSpec::new("counts")))?;
    plan.add_edge(&values, &pass)?;
    plan.add_edge(&pass, &count)?;
    plan.add_edge(&count, &counts)?;
    Ok(plan)
}

fn run() -> Result<(), ExecError> {
    let mut registry = Registry::new();
    register_builtins(&mut registry)?;
    let executor = Executor::new(ExecConfig::new(), registry);

    let execution = executor.execute(&demo_plan()?, CancellationToken::new())?;
    for (name, result) in execution.results() {
        while let Some(table) = result.next_table() {
            let table = table?;
            println!("{} {} {:?}", name, table.key(), table.column_values("_value"));
        }
    }
    let stats = execution.wait()?;
    for profile in &stats.profiles {
        println!("{} {} messages={} duration={:?}", profile.node_type, profile.label, profile.count, profile.total_duration);
    }
    println!("max allocated: {} bytes", stats.max_allocated);
    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "oxid_flow=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("OxidFlow - Rusty stream execution");
    if let Err(e) = run() {
        eprintln!("execution failed: {}", e);
        std::process::exit(1);
    }
}
