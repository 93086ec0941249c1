use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qlora_tuner::config::DataSettings;
use qlora_tuner::processors::{format_alternating, format_instruction, FormatContext, ProcessorRegistry};
use serde_json::{json, Value};

fn chat_settings(dataset_type: &str) -> DataSettings {
    DataSettings {
        dataset_type: dataset_type.into(),
        dataset: "train.jsonl".into(),
        instruct_header: Some("Instruction".into()),
        input_header: Some("Input".into()),
        output_header: Some("Response".into()),
        user_header: Some("### Human:\n".into()),
        response_header: Some("### Assistant:\n".into()),
    }
}

fn records(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "instruction": format!("Summarize document {i}"),
                "input": "Rust is a systems programming language focused on safety.",
                "output": "A safe systems language.",
                "data": [
                    {"from": "human", "value": format!("question {i}")},
                    {"from": "gpt", "value": "an answer"},
                    {"from": "human", "value": "a follow-up"},
                    {"from": "gpt", "value": "another answer"},
                ],
            })
        })
        .collect()
}

fn benchmark_prompt_formatting(c: &mut Criterion) {
    let mut group = c.benchmark_group("prompt_formatting");

    group.bench_function("instruction_single", |b| {
        b.iter(|| {
            format_instruction(
                black_box(&qlora_tuner::processors::InstructionRecord {
                    instruction: "Summarize".into(),
                    input: "text".into(),
                    output: "ok".into(),
                }),
                "Instruction",
                "Input",
                "Response",
            )
        });
    });

    let turns: Vec<String> = (0..16).map(|i| format!("turn number {i}")).collect();
    group.bench_function("alternating_16_turns", |b| {
        b.iter(|| format_alternating(black_box(&turns), "### Human:\n", "### Assistant:\n", "</s>"));
    });

    let registry = ProcessorRegistry::with_defaults();
    let data = records(1000);
    for tag in ["alpaca", "wvu"] {
        let settings = chat_settings(tag);
        let ctx = FormatContext {
            data: &settings,
            eos_token: "</s>",
        };
        group.bench_function(format!("transform_1000_{tag}"), |b| {
            b.iter(|| registry.transform(tag, black_box(&data), &ctx).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_prompt_formatting);
criterion_main!(benches);
