use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use chrono::{DateTime, Utc};

use crate::{CronError, CronResult};

/// 返回本机的第一个非环回IPv4地址
///
/// 通过向公网地址"连接"一个UDP套接字让内核选出出口网卡，不会真正发送数据。
pub fn local_ipv4() -> CronResult<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
        _ => Err(CronError::NoLocalIp),
    }
}

/// 解析节点标识：优先使用配置值，其次本机IPv4，最后退化为主机名
pub fn resolve_identity(configured: Option<&str>) -> CronResult<String> {
    if let Some(identity) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(identity.to_string());
    }

    match local_ipv4() {
        Ok(ip) => Ok(ip.to_string()),
        Err(_) => hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .map_err(|_| CronError::NoLocalIp),
    }
}

/// 从存储key中去掉目录前缀，得到任务名或节点名
pub fn extract_name<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}

/// 毫秒级unix时间戳
pub fn unix_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}
