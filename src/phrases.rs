//! Scripted replies spoken without consulting the language model.

use rand::seq::SliceRandom;

pub const GOODBYE_PHRASES: &[&str] = &[
    "好的，拜拜~有需要随时叫我哦！",
    "好哒，那我先走啦，拜拜~",
    "收到！我先退下啦，有需要再叫我~",
    "明白！那我先不打扰你啦，拜拜~",
    "好的呢，有事随时呼唤我，拜拜~",
    "好哒，我先去休息一下，需要我时再叫我哦~",
    "收到！那我就先告退啦，拜拜~",
    "好的，我先离开啦，有问题随时找我~",
    "明白！我先下线休息了，需要时再唤醒我~",
    "好哒好哒，那我先走啦，回见~",
];

pub const TIMEOUT_PHRASES: &[&str] = &[
    "你好像在忙别的事情，我先退下啦~",
    "看来你暂时不需要我了，我先休息一下~",
    "你有一会儿没说话了，我先去充电啦~",
    "看起来你在忙，我先不打扰了~",
    "看来你有别的事情要忙，我先离开啦~",
    "你有段时间没说话了，我先去休息了~",
];

/// Reply to an explicit farewell.
pub fn goodbye() -> &'static str {
    pick(GOODBYE_PHRASES)
}

/// Reply when the session is closed for inactivity.
pub fn timeout() -> &'static str {
    pick(TIMEOUT_PHRASES)
}

fn pick(pool: &'static [&'static str]) -> &'static str {
    pool.choose(&mut rand::thread_rng()).copied().unwrap_or_default()
}
