use pd_client::{PdClient, RpcCaller, RpcError, RpcResult};
use pd_core::ChannelId;
use pd_heater::{
    BoardConfig, ControlConfig, HeaterDevice, PidGains, SimulatedBoard, TemperatureControl,
    ThermalModel, ZoneConfig,
};
use serde_json::{Value, json};

/// Gateway stand-in answering from a simulated board.
struct LoopbackGateway {
    board: SimulatedBoard,
    calls: u64,
}

impl RpcCaller for LoopbackGateway {
    fn call(&mut self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        self.calls += 1;
        let remote = |message: String| RpcError::Remote {
            method: method.to_string(),
            code: -32000,
            message,
        };
        match method {
            "get_temperatures" => self
                .board
                .read_temperatures()
                .map(|readings| json!(readings.values().copied().collect::<Vec<_>>()))
                .map_err(|err| remote(err.to_string())),
            "set_pwm_duty_cycle" => {
                let (Some(channel), Some(duty)) = (
                    params.first().and_then(Value::as_u64),
                    params.get(1).and_then(Value::as_f64),
                ) else {
                    return Err(remote(format!("bad params {params:?}")));
                };
                self.board
                    .set_duty_cycle(ChannelId::new(channel as u16), duty)
                    .map(|()| Value::Null)
                    .map_err(|err| remote(err.to_string()))
            }
            _ => Err(RpcError::Remote {
                method: method.to_string(),
                code: -32601,
                message: "Method not found".to_string(),
            }),
        }
    }
}

fn gateway(board: &SimulatedBoard) -> PdClient<LoopbackGateway> {
    PdClient::new(LoopbackGateway {
        board: board.clone(),
        calls: 0,
    })
}

fn plant() -> SimulatedBoard {
    let model = ThermalModel::new(20.0, 200.0, 0.5).unwrap();
    SimulatedBoard::new(model, 2, 1.0)
}

#[test]
fn unknown_method_surfaces_remote_error() {
    let mut client = gateway(&plant());
    assert!(matches!(
        client.active_capacitance(),
        Err(RpcError::Remote { code: -32601, .. })
    ));
    assert_eq!(client.caller().calls, 1);
}

#[test]
fn gateway_failures_reach_the_controller_as_device_errors() {
    let board = plant();
    let mut client = gateway(&board);
    board.fail_next_reads(1);
    let err = client.read_temperatures().unwrap_err();
    assert!(err.is_transient());
    assert_eq!(client.read_temperatures().unwrap().len(), 2);
}

#[test]
fn controller_regulates_board_through_gateway() {
    let board = plant();
    let gains = PidGains::new(1.0, 0.1, 0.0);
    let config = BoardConfig {
        name: "gateway".to_string(),
        control: ControlConfig {
            filter_time_constant_s: 2.0,
            ..ControlConfig::default()
        },
        zones: vec![
            ZoneConfig::new(ChannelId::new(0), ChannelId::new(0), gains, 5.0),
            ZoneConfig::new(ChannelId::new(1), ChannelId::new(1), gains, 5.0),
        ],
    };
    let control = TemperatureControl::new(gateway(&board), config).unwrap();
    control.set_target(60.0).unwrap();
    for _ in 0..600 {
        assert!(control.step(1.0).unwrap().is_clean());
    }
    let drop_c = control.drop_temperature().unwrap();
    assert!((drop_c - 60.0).abs() < 0.5, "drop temperature {drop_c}");

    control.stop().unwrap();
    assert_eq!(board.duty(ChannelId::new(0)), Some(0.0));
    assert_eq!(board.duty(ChannelId::new(1)), Some(0.0));
}
