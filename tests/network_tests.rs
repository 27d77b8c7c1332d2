#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::sync::Arc;

    use stealth_shift::{LinkControl, MacAddress, SystemRunner};

    // These tests talk to the real network stack. The ones that change
    // interfaces need root and are ignored by default.

    fn system_link() -> LinkControl {
        LinkControl::system(Arc::new(SystemRunner::default()))
    }

    #[test]
    fn test_interface_exists() {
        let link = system_link();
        // Loopback is present on any Linux host
        assert!(link.exists("lo"));
        assert!(!link.exists("nonexistent12"));
    }

    #[test]
    fn test_mechanism_order() {
        assert_eq!(
            system_link().mechanism_names(),
            vec!["ioctl", "ifconfig", "ip link"]
        );
    }

    #[test]
    fn test_loopback_state() {
        let link = system_link();
        assert!(link.current("lo").is_ok());
        assert!(link.is_up("lo").unwrap());
    }

    fn create_dummy_interface(name: &str) -> Result<(), std::io::Error> {
        Command::new("ip")
            .args(["link", "add", name, "type", "dummy"])
            .status()?;

        Command::new("ip")
            .args(["link", "set", name, "up"])
            .status()?;

        Ok(())
    }

    fn delete_dummy_interface(name: &str) -> Result<(), std::io::Error> {
        Command::new("ip").args(["link", "delete", name]).status()?;
        Ok(())
    }

    #[test]
    #[ignore = "Requires root permissions"]
    fn test_change_mac_on_dummy_interface() {
        let dummy_name = "shiftdummy0";

        match create_dummy_interface(dummy_name) {
            Ok(_) => {
                let link = system_link();
                assert!(link.exists(dummy_name));

                let original = link.current(dummy_name).unwrap();
                let target = MacAddress::generate();
                link.apply(dummy_name, &target).unwrap();
                assert_eq!(link.current(dummy_name).unwrap(), target);
                assert!(link.is_up(dummy_name).unwrap());

                link.apply(dummy_name, &original).unwrap();
                assert_eq!(link.current(dummy_name).unwrap(), original);

                if let Err(e) = delete_dummy_interface(dummy_name) {
                    eprintln!("Failed to delete dummy interface: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Failed to create dummy interface: {}", e);
            }
        }
    }

    #[test]
    #[ignore = "Requires root permissions"]
    fn test_set_state_on_dummy_interface() {
        let dummy_name = "shiftdummy1";

        if let Err(e) = create_dummy_interface(dummy_name) {
            eprintln!("Failed to create dummy interface: {}", e);
            return;
        }
        let link = system_link();
        link.set_state(dummy_name, false).unwrap();
        assert!(!link.is_up(dummy_name).unwrap());
        link.set_state(dummy_name, true).unwrap();
        assert!(link.is_up(dummy_name).unwrap());

        if let Err(e) = delete_dummy_interface(dummy_name) {
            eprintln!("Failed to delete dummy interface: {}", e);
        }
    }
}
