//! Conversion between profile settings and configurations

use super::{AddrFamily, ConfigSource, IpAddress, IpConfig, IpRoute};
use crate::error::Result;
use crate::profile::{IpMethod, IpSetting, RouteSetting};

impl IpConfig {
    /// Build the static fragment for a profile's settings
    pub fn from_setting(
        ifindex: u32,
        family: AddrFamily,
        setting: &IpSetting,
        default_route_metric: u32,
    ) -> Result<Self> {
        let mut config = Self::new(ifindex, family);
        config.merge_setting(setting, default_route_metric)?;
        Ok(config)
    }

    /// Add the static parts of `setting`
    ///
    /// A disabled method contributes nothing. A gateway yields a default
    /// route unless `never_default` is set.
    pub fn merge_setting(&mut self, setting: &IpSetting, default_route_metric: u32) -> Result<()> {
        if setting.method == IpMethod::Disabled {
            return Ok(());
        }
        setting.validate(self.family())?;
        let metric = setting.route_metric.unwrap_or(default_route_metric);

        for net in &setting.addresses {
            self.add_address(
                IpAddress::new(net.addr(), net.prefix_len()).with_source(ConfigSource::Static),
            )?;
        }

        if let Some(gateway) = setting.gateway {
            if !setting.never_default {
                self.set_gateway(Some(gateway));
                self.add_route(IpRoute::default_via(gateway, metric))?;
            }
        }

        for route in &setting.routes {
            let mut entry = IpRoute::new(
                route.dest.addr(),
                route.dest.prefix_len(),
                route.metric.unwrap_or(metric),
            );
            if let Some(next_hop) = route.next_hop {
                entry = entry.with_gateway(next_hop);
            }
            self.add_route(entry)?;
        }

        if setting.never_default {
            self.set_never_default(true);
        }
        for ns in &setting.dns {
            self.add_nameserver(*ns);
        }
        for search in &setting.dns_search {
            self.add_search(search);
        }
        for option in &setting.dns_options {
            self.add_dns_option(option);
        }
        if setting.dns_priority != 0 {
            self.set_dns_priority(setting.dns_priority);
        }
        Ok(())
    }

    /// Describe this configuration as profile settings
    ///
    /// Addresses obtained automatically switch the method to `Auto` and are
    /// not written out; kernel-owned and default routes are skipped.
    pub fn create_setting(&self) -> IpSetting {
        let automatic = |source: ConfigSource| {
            matches!(
                source,
                ConfigSource::Dhcp | ConfigSource::Autoconf | ConfigSource::Kernel
            )
        };

        let addresses: Vec<_> = self
            .addresses()
            .filter(|a| !automatic(a.source) && !a.is_link_local())
            .filter_map(IpAddress::network_with_host)
            .collect();
        let method = if self.addresses().any(|a| automatic(a.source) && !a.is_link_local()) {
            IpMethod::Auto
        } else if !addresses.is_empty() {
            IpMethod::Manual
        } else {
            IpMethod::Disabled
        };

        let mut setting = IpSetting::with_method(method);
        setting.addresses = addresses;
        setting.gateway = self.gateway();
        setting.never_default = self.never_default();
        setting.routes = self
            .routes()
            .filter(|r| !r.is_default() && !automatic(r.source))
            .filter_map(|r| {
                Some(RouteSetting {
                    dest: r.destination()?,
                    next_hop: r.gateway,
                    metric: Some(r.metric),
                })
            })
            .collect();
        setting.dns = self.nameservers().copied().collect();
        setting.dns_search = self.searches().cloned().collect();
        setting.dns_options = self.dns_options().cloned().collect();
        setting.dns_priority = self.dns_priority();
        setting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_from_setting_builds_default_route() {
        let setting = IpSetting::manual(vec!["10.0.0.5/24".parse().unwrap()])
            .with_gateway(ip("10.0.0.1"))
            .with_dns(vec![ip("1.1.1.1")]);
        let cfg = IpConfig::from_setting(3, AddrFamily::V4, &setting, 100).unwrap();

        assert_eq!(cfg.num_addresses(), 1);
        let route = cfg.best_default_route().unwrap();
        assert_eq!(route.gateway, Some(ip("10.0.0.1")));
        assert_eq!(route.metric, 100);
        assert_eq!(cfg.num_nameservers(), 1);
    }

    #[test]
    fn test_never_default_setting_omits_default_route() {
        let setting = IpSetting::manual(vec!["10.0.0.5/24".parse().unwrap()])
            .with_gateway(ip("10.0.0.1"))
            .with_never_default(true);
        let cfg = IpConfig::from_setting(3, AddrFamily::V4, &setting, 100).unwrap();
        assert!(!cfg.has_default_route());
        assert!(cfg.never_default());
    }

    #[test]
    fn test_disabled_contributes_nothing() {
        let cfg = IpConfig::from_setting(3, AddrFamily::V6, &IpSetting::disabled(), 100).unwrap();
        assert!(cfg.is_empty());
    }

    #[test]
    fn test_create_setting_round_trip() {
        let setting = IpSetting::manual(vec!["10.0.0.5/24".parse().unwrap()])
            .with_gateway(ip("10.0.0.1"))
            .with_dns(vec![ip("1.1.1.1"), ip("9.9.9.9")]);
        let cfg = IpConfig::from_setting(3, AddrFamily::V4, &setting, 100).unwrap();

        let back = cfg.create_setting();
        assert_eq!(back.method, IpMethod::Manual);
        assert_eq!(back.addresses, setting.addresses);
        assert_eq!(back.gateway, setting.gateway);
        assert_eq!(back.dns, setting.dns);
        assert!(back.routes.is_empty());
    }

    #[test]
    fn test_create_setting_dhcp_is_auto() {
        let mut cfg = IpConfig::new(3, AddrFamily::V4);
        cfg.add_address(
            IpAddress::new(ip("192.168.1.10"), 24).with_source(ConfigSource::Dhcp),
        )
        .unwrap();
        let setting = cfg.create_setting();
        assert_eq!(setting.method, IpMethod::Auto);
        assert!(setting.addresses.is_empty());
    }
}
