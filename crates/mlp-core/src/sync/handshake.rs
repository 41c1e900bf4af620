//! ネットワーク停止判定のハンドシェイク
//!
//! 最終出力グループの STPN パケットと、各コア自身のエポック終了は、どちらが先に
//! 起きてもよい。後から来た側が両方を消費して判定を確定させる。

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetStopHandshake {
    decision: Option<bool>,
    epoch_ready: bool,
}

impl NetStopHandshake {
    pub fn new() -> NetStopHandshake {
        NetStopHandshake::default()
    }

    /// STPN 受信。エポック終了済みなら判定を返す
    pub fn on_decision(&mut self, stop: bool) -> Option<bool> {
        if self.epoch_ready {
            self.epoch_ready = false;
            Some(stop)
        } else {
            self.decision = Some(stop);
            None
        }
    }

    /// エポック終了。判定受信済みならそれを返す
    pub fn on_epoch_end(&mut self) -> Option<bool> {
        match self.decision.take() {
            Some(stop) => Some(stop),
            None => {
                self.epoch_ready = true;
                None
            }
        }
    }
}
