#![allow(dead_code)]

/// 跟踪状态机
///
/// Idle -> Bootstrapping：注册 marker 或显式 reset；
/// Bootstrapping -> Tracking：内点或视差足够；
/// Tracking -> Bootstrapping：特征点数量低于下限（跟踪丢失）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    #[default]
    Idle,
    Bootstrapping,
    Tracking,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp(pub i64);
impl Timestamp {
    pub fn as_sec(&self) -> f64 {
        self.0 as f64 / 1e9
    }
    /// dt
    pub fn duration_since(&self, other: &Timestamp) -> f64 {
        (self.0 - other.0) as f64 / 1e9
    }
}

#[test]
fn test_timestamp() {
    let t1 = Timestamp(1_000_000_000);
    let t2 = Timestamp(3_500_000_000);
    assert_eq!(t1.as_sec(), 1.0);
    assert_eq!(t2.duration_since(&t1), 2.5);
}
