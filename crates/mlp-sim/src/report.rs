//! ホスト報告の記録と Lens 形式の出力ファイル
//!
//! ```text
//! for each example:
//!   <epoch> <example>
//!   <ticks-on-example> <num-groups>
//!   for each tick (tick 0 is the implicit initial state):
//!     <tick> <event>
//!     for each output group:
//!       <num-units> 1
//!       for each unit: <output> <target or ->
//! ```

use std::collections::BTreeMap;
use std::io::{self, Write};

use mlp_core::types::{SHORT_ACTIV_NAN, SHORT_ACTIV_SHIFT, ShortActivation};
use mlp_core::{ExitCode, HostMessage, HostSink, TestResults, TickRecord};

type Values = Vec<(ShortActivation, ShortActivation)>;

#[derive(Debug)]
struct TickOutputs {
    record: TickRecord,
    groups: BTreeMap<usize, Values>,
}

/// 1 ステージ分のホスト報告
#[derive(Debug, Default)]
pub struct StageRecorder {
    /// 出力グループ → ユニット数
    groups: BTreeMap<usize, usize>,
    /// (epoch, example) → tick 順の出力
    examples: BTreeMap<(u32, u32), Vec<TickOutputs>>,
    final_results: Option<(TestResults, ExitCode)>,
}

impl StageRecorder {
    pub fn new() -> StageRecorder {
        StageRecorder::default()
    }

    pub fn final_results(&self) -> Option<(TestResults, ExitCode)> {
        self.final_results
    }

    /// 報告のあった出力グループ
    pub fn groups(&self) -> impl Iterator<Item = usize> + '_ {
        self.groups.keys().copied()
    }

    /// 記録した tick 数
    pub fn num_ticks(&self) -> usize {
        self.examples.values().map(Vec::len).sum()
    }

    fn record(&mut self, group: usize, record: TickRecord, values: Values) {
        let ticks = self.examples.entry((record.epoch, record.example)).or_default();
        let at = (record.tick, record.event);
        match ticks.iter_mut().rev().find(|t| (t.record.tick, t.record.event) == at) {
            Some(t) => {
                t.groups.insert(group, values);
            }
            None => {
                let mut groups = BTreeMap::new();
                groups.insert(group, values);
                ticks.push(TickOutputs { record, groups });
            }
        }
    }

    pub fn write_lens<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for (&(epoch, example), ticks) in &self.examples {
            writeln!(out, "{epoch} {example}")?;
            writeln!(out, "{} {}", ticks.len() + 1, self.groups.len())?;
            writeln!(out, "0 -1")?;
            for &units in self.groups.values() {
                writeln!(out, "{units} 1")?;
                for _ in 0..units {
                    writeln!(out, "{:8.6} 0", 0.0)?;
                }
            }
            for t in ticks {
                writeln!(out, "{} {}", t.record.tick, t.record.event)?;
                for (group, &units) in &self.groups {
                    writeln!(out, "{units} 1")?;
                    match t.groups.get(group) {
                        Some(values) => {
                            for &(output, target) in values {
                                let (output, target) = (short_to_f64(output), target_text(target));
                                writeln!(out, "{output:8.6} {target}")?;
                            }
                        }
                        None => {
                            for _ in 0..units {
                                writeln!(out, "{:8.6} -", 0.0)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl HostSink for StageRecorder {
    fn deliver(&mut self, message: HostMessage) -> io::Result<()> {
        match message {
            HostMessage::Info { group, num_units, training, num_examples } => {
                log::debug!(
                    "host: group {group} units={num_units} examples={num_examples} train={training}"
                );
                self.groups.insert(group, num_units);
            }
            HostMessage::Outputs { group, record, values } => self.record(group, record, values),
            HostMessage::Final { group, results, exit } => {
                log::debug!("host: group {group} final {exit:?}");
                self.final_results = Some((results, exit));
            }
        }
        Ok(())
    }
}

fn short_to_f64(v: ShortActivation) -> f64 {
    v as f64 / (1 << SHORT_ACTIV_SHIFT) as f64
}

fn target_text(v: ShortActivation) -> String {
    if v == SHORT_ACTIV_NAN { "-".to_string() } else { format!("{}", short_to_f64(v)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(
        group: usize,
        tick: u32,
        output: ShortActivation,
        target: ShortActivation,
    ) -> HostMessage {
        let record = TickRecord { epoch: 0, example: 1, event: 0, tick };
        HostMessage::Outputs { group, record, values: vec![(output, target)] }
    }

    #[test]
    fn test_lens_layout() {
        let mut rec = StageRecorder::new();
        for group in [3, 4] {
            let info = HostMessage::Info { group, num_units: 1, training: false, num_examples: 2 };
            rec.deliver(info).unwrap();
        }
        rec.deliver(outputs(3, 1, 1 << 14, 1 << 14)).unwrap();
        rec.deliver(outputs(4, 1, 0, SHORT_ACTIV_NAN)).unwrap();
        assert_eq!(rec.num_ticks(), 1);
        assert_eq!(rec.groups().collect::<Vec<_>>(), vec![3, 4]);

        let mut buf = Vec::new();
        rec.write_lens(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let expected = "0 1\n2 2\n0 -1\n1 1\n0.000000 0\n1 1\n0.000000 0\n\
                        1 0\n1 1\n0.500000 0.5\n1 1\n0.000000 -\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_final_kept() {
        let mut rec = StageRecorder::new();
        let results = TestResults { examples_tested: 2, ..TestResults::default() };
        rec.deliver(HostMessage::Final { group: 3, results, exit: ExitCode::NoError }).unwrap();
        assert_eq!(rec.final_results(), Some((results, ExitCode::NoError)));
    }
}
