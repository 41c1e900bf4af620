//! MLP ネットワークのシミュレータ
//!
//! ネットワーク記述（TOML、`.gz` 可）を読み、記述されたステージを順に実行する。
//! 学習ステージで更新された重みは次のステージへ引き継ぐ。

mod io;
mod report;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use mlp_core::{
    DeliveryOrder, ExitCode, MachineOptions, Network, NetworkDescription, RunSummary, StageDesc,
    StageKind, TestResults,
};

use crate::report::StageRecorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Order {
    Fifo,
    Shuffled,
}

#[derive(Parser, Debug)]
#[command(name = "mlp-sim")]
#[command(about = "パケット駆動コアで MLP ネットワークを学習・テストする")]
struct Cli {
    /// ネットワーク記述ファイル（TOML）
    description: PathBuf,

    /// 記述のステージを「N エポック学習 → テスト」に置き換える
    #[arg(long)]
    train_epochs: Option<u32>,

    /// 記述のステージをテスト 1 回に置き換える
    #[arg(long, default_value_t = false, conflicts_with = "train_epochs")]
    test: bool,

    /// パケットの配送順
    #[arg(long, value_enum, default_value_t = Order::Fifo)]
    order: Order,

    /// shuffled 配送の乱数シード
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// 出力ファイル（Lens 形式、`-` は標準出力）
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// ステージごとの集計を JSON で書き出す
    #[arg(long)]
    summary: Option<PathBuf>,

    /// 最終の重みを JSON で書き出す
    #[arg(long)]
    weights: Option<PathBuf>,

    /// パケットの配送記録をテキストで書き出す
    #[arg(long)]
    trace: Option<PathBuf>,

    /// ログレベル（RUST_LOG が優先）
    #[arg(long, default_value = "info")]
    log_level: String,

    /// プロトコル違反を数えて無視する（release ビルドの既定）
    #[arg(long, default_value_t = false)]
    lenient: bool,

    /// プロトコル違反でステージを終了する（debug ビルドの既定）
    #[arg(long, default_value_t = false, conflicts_with = "lenient")]
    strict: bool,

    /// デッドロック回復を有効にする
    #[arg(long, default_value_t = false)]
    deadlock_recovery: bool,
}

#[derive(Debug, Serialize)]
struct StageReport {
    stage: usize,
    kind: StageKind,
    exit: ExitCode,
    results: Option<TestResults>,
    elapsed_sec: f64,
    summary: RunSummary,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let text = io::read_text(&cli.description)
        .with_context(|| format!("記述ファイルを読めません: {}", cli.description.display()))?;
    let mut desc = NetworkDescription::from_toml_str(&text)
        .with_context(|| format!("記述ファイルの解析に失敗: {}", cli.description.display()))?;
    if cli.lenient {
        desc.network.strict = false;
    } else if cli.strict {
        desc.network.strict = true;
    }
    if cli.deadlock_recovery {
        desc.network.deadlock_recovery = true;
    }
    if let Some(epochs) = cli.train_epochs {
        desc.stages = vec![StageDesc::train(epochs), StageDesc::test()];
    } else if cli.test {
        desc.stages = vec![StageDesc::test()];
    }

    let mut net = Network::new(desc).context("ネットワークを構成できません")?;
    let options = MachineOptions {
        order: match cli.order {
            Order::Fifo => DeliveryOrder::Fifo,
            Order::Shuffled => DeliveryOrder::Shuffled { seed: cli.seed },
        },
        ..MachineOptions::default()
    };

    eprintln!("記述: {}", cli.description.display());
    eprintln!("グループ数: {} (bias を含む)", net.num_groups());
    eprintln!("例題数: {}", net.examples().examples.len());
    eprintln!("tick 上限: {}", net.global_max_ticks());
    eprintln!();

    let mut trace = cli
        .trace
        .as_ref()
        .map(io::open_writer)
        .transpose()
        .context("配送記録ファイルを作成できません")?;
    let mut out = cli
        .output
        .as_ref()
        .map(io::open_writer)
        .transpose()
        .context("出力ファイルを作成できません")?;
    let stages = net.stages().to_vec();
    let mut reports = Vec::with_capacity(stages.len());

    for (i, stage) in stages.iter().enumerate() {
        let mut machine = net
            .build_machine(stage, &options)
            .with_context(|| format!("ステージ {i} の構成に失敗"))?;
        log::info!("stage {i}: {:?}, {} cores", stage.kind, machine.len());
        if trace.is_some() {
            machine.record_deliveries();
        }

        let mut recorder = StageRecorder::new();
        let start = Instant::now();
        let summary =
            machine.run(&mut recorder).with_context(|| format!("ステージ {i} の実行に失敗"))?;
        let elapsed = start.elapsed().as_secs_f64();

        if stage.kind == StageKind::Train {
            net.absorb_weights(&machine);
        }
        if let Some(w) = out.as_mut().filter(|_| net.params().write_out) {
            recorder.write_lens(w).context("出力ファイルへの書き込みに失敗")?;
        }
        if let Some(w) = trace.as_mut() {
            writeln!(w, "# stage {i}")?;
            for d in machine.deliveries() {
                let placements = machine.placements();
                let (from, to) = (&placements[d.source].label, &placements[d.dest].label);
                writeln!(w, "{from} -> {to} {} 0x{:08x}", d.packet.key, d.packet.payload)?;
            }
        }

        let exit = summary.exit_code();
        let results = recorder.final_results().map(|(r, _)| r);
        eprintln!("=== ステージ {i} ({:?}) ===", stage.kind);
        eprintln!("終了コード: {exit}");
        let names: Vec<&str> = recorder.groups().filter_map(|g| net.group_name(g)).collect();
        eprintln!("出力グループ: {} ({} tick 記録)", names.join(", "), recorder.num_ticks());
        if let Some(r) = &results {
            eprintln!("学習エポック数: {}", r.epochs_trained);
            eprintln!("テスト例題数: {} (正解 {})", r.examples_tested, r.examples_correct);
            eprintln!("テスト tick 数: {}", r.ticks_tested);
        }
        let total = summary.total();
        eprintln!(
            "配送パケット数: {} (破棄 {}, 保留 {})",
            summary.delivered, summary.dropped, total.deferred
        );
        if total.violations > 0 {
            log::warn!("stage {i}: {} protocol violations", total.violations);
        }
        if total.recoveries > 0 {
            log::warn!("stage {i}: deadlock recovery ran {} times", total.recoveries);
        }
        eprintln!("経過時間: {elapsed:.3}s");
        eprintln!();

        reports.push(StageReport {
            stage: i,
            kind: stage.kind,
            exit,
            results,
            elapsed_sec: elapsed,
            summary,
        });
        if !exit.is_ok() {
            break;
        }
    }

    if let Some(w) = out {
        w.close().context("出力ファイルを閉じられません")?;
    }
    if let Some(w) = trace {
        w.close().context("配送記録ファイルを閉じられません")?;
    }
    if let Some(path) = &cli.summary {
        let mut w = io::open_writer(path).context("集計ファイルを作成できません")?;
        serde_json::to_writer_pretty(&mut w, &reports)?;
        writeln!(w)?;
        w.close()?;
    }
    if let Some(path) = &cli.weights {
        let blocks: BTreeMap<String, Vec<f64>> = net
            .linked_blocks()
            .filter_map(|(from, to, _)| Some((format!("{from}->{to}"), net.weights_f64(from, to)?)))
            .collect();
        let mut w = io::open_writer(path).context("重みファイルを作成できません")?;
        serde_json::to_writer_pretty(&mut w, &blocks)?;
        writeln!(w)?;
        w.close()?;
    }

    if let Some(failed) = reports.iter().find(|r| !r.exit.is_ok()) {
        bail!("ステージ {} が異常終了しました: {}", failed.stage, failed.exit);
    }
    Ok(())
}
