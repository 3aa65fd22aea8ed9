//! リクエストキュー
//!
//! 受理済みで未完了のリクエストを投入順に保持するキュー。
//! 書き込み済みカーソルで 2 つの区間に分割される:
//!
//! ```text
//! [0, written)    書き込み済みでレスポンス待ち (running)
//! [written, len)  受理済みで未書き込み (pending)
//! ```
//!
//! 構造的不変条件: `written <= len`。レスポンスは投入順に完了するため、
//! 完了は常に先頭の pop になる。所有者はエンジンのみで、
//! 外部からの変更は行われない。

use std::collections::VecDeque;

/// 書き込み済みカーソル方式のリクエストキュー
#[derive(Debug)]
pub struct Queue<T> {
    entries: VecDeque<T>,
    written: usize,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// 新しいキューを作成
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            written: 0,
        }
    }

    fn check_invariant(&self) {
        debug_assert!(self.written <= self.entries.len());
    }

    /// 末尾に追加
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
        self.check_invariant();
    }

    /// 実行中 (書き込み済みでレスポンス待ち) の数
    pub fn running_len(&self) -> usize {
        self.written
    }

    /// 未書き込みの数
    pub fn pending_len(&self) -> usize {
        self.entries.len() - self.written
    }

    /// 未完了 (実行中 + 未書き込み) の数
    pub fn unfinished_len(&self) -> usize {
        self.entries.len()
    }

    /// 未完了のエントリーがないかどうか
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 次に書き込むエントリーを取得
    pub fn next_pending(&self) -> Option<&T> {
        self.entries.get(self.written)
    }

    /// 次に書き込むエントリーを取得 (可変)
    pub fn next_pending_mut(&mut self) -> Option<&mut T> {
        self.entries.get_mut(self.written)
    }

    /// 次のエントリーを書き込み済みに進める
    ///
    /// ソケットへの書き込みが成功した後に呼ぶ。
    pub fn advance_pending(&mut self) {
        debug_assert!(self.written < self.entries.len());
        self.written += 1;
        self.check_invariant();
    }

    /// 次の未書き込みエントリーをキューから取り除く
    ///
    /// 書き込みに失敗したエントリーの破棄に使う。
    pub fn remove_next_pending(&mut self) -> Option<T> {
        let entry = self.entries.remove(self.written);
        self.check_invariant();
        entry
    }

    /// 最も古い実行中エントリーを取得
    pub fn oldest_running(&self) -> Option<&T> {
        if self.written > 0 {
            self.entries.front()
        } else {
            None
        }
    }

    /// 最も古い実行中エントリーを取得 (可変)
    pub fn oldest_running_mut(&mut self) -> Option<&mut T> {
        if self.written > 0 {
            self.entries.front_mut()
        } else {
            None
        }
    }

    /// 実行中エントリーを走査 (可変)
    pub fn running_iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().take(self.written)
    }

    /// 最も古い実行中エントリーを完了として取り出す
    pub fn complete_oldest(&mut self) -> Option<T> {
        if self.written > 0 {
            self.written -= 1;
            let entry = self.entries.pop_front();
            self.check_invariant();
            entry
        } else {
            None
        }
    }

    /// 実行中エントリーをすべて取り除いて返す
    ///
    /// ソケット破棄時に使う。未書き込みエントリーはキューに残り、
    /// 再接続後に通常の再開ループで再送される。
    pub fn take_running(&mut self) -> Vec<T> {
        let drained: Vec<T> = self.entries.drain(..self.written).collect();
        self.written = 0;
        self.check_invariant();
        drained
    }

    /// 未書き込みエントリーをすべて取り除いて返す
    pub fn take_pending(&mut self) -> Vec<T> {
        let drained: Vec<T> = self.entries.drain(self.written..).collect();
        self.check_invariant();
        drained
    }

    /// 未完了エントリーをすべて取り除いて返す (破棄用)
    pub fn take_unfinished(&mut self) -> Vec<T> {
        self.written = 0;
        let drained: Vec<T> = self.entries.drain(..).collect();
        self.check_invariant();
        drained
    }

    /// 条件に一致する最初の未書き込みエントリーを取り除いて返す
    pub fn remove_pending_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self
            .entries
            .iter()
            .skip(self.written)
            .position(|entry| predicate(entry))?;
        let entry = self.entries.remove(self.written + index);
        self.check_invariant();
        entry
    }

    /// 条件に一致する実行中エントリーがあるか確認
    pub fn running_contains(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        self.entries
            .iter()
            .take(self.written)
            .any(|entry| predicate(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_progression() {
        let mut queue = Queue::new();
        queue.push("a");
        queue.push("b");
        queue.push("c");
        assert_eq!(queue.pending_len(), 3);
        assert_eq!(queue.running_len(), 0);

        assert_eq!(queue.next_pending(), Some(&"a"));
        queue.advance_pending();
        queue.advance_pending();
        assert_eq!(queue.running_len(), 2);
        assert_eq!(queue.pending_len(), 1);

        assert_eq!(queue.complete_oldest(), Some("a"));
        assert_eq!(queue.running_len(), 1);
        assert_eq!(queue.complete_oldest(), Some("b"));
        assert_eq!(queue.complete_oldest(), None);
        assert_eq!(queue.unfinished_len(), 1);
    }

    #[test]
    fn take_running_preserves_pending() {
        let mut queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        queue.advance_pending();
        queue.advance_pending();

        let failed = queue.take_running();
        assert_eq!(failed, vec![1, 2]);
        assert_eq!(queue.running_len(), 0);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.next_pending(), Some(&3));
    }

    #[test]
    fn take_unfinished_empties_queue() {
        let mut queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.advance_pending();

        let drained = queue.take_unfinished();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_pending_where_skips_running() {
        let mut queue = Queue::new();
        queue.push(1);
        queue.push(2);
        queue.advance_pending();

        // 1 は実行中なので対象外
        assert_eq!(queue.remove_pending_where(|&n| n == 1), None);
        assert_eq!(queue.remove_pending_where(|&n| n == 2), Some(2));
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn long_sequence_keeps_order() {
        let mut queue = Queue::new();
        for i in 0..100 {
            queue.push(i);
        }
        for _ in 0..50 {
            queue.advance_pending();
        }
        for i in 0..50 {
            assert_eq!(queue.complete_oldest(), Some(i));
        }
        assert_eq!(queue.next_pending(), Some(&50));
        assert_eq!(queue.pending_len(), 50);
    }
}
